//! Shared harness for the integration tests: real raft nodes over TCP and a
//! minimal Postgres wire client.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail, ensure};
use raft::StateRole;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use replicated_sql::config::NodeConfig;
use replicated_sql::frontend::{self, Frontend};
use replicated_sql::runtime::{FatalSignal, RaftHandle, spawn_node};
use replicated_sql::state_machine::ReplicatedStateMachine;
use replicated_sql::store::MemStore;
use replicated_sql::table::TableStore;

/// One running node: its raft handle plus direct access to its tables.
pub struct TestNode {
    pub raft: RaftHandle,
    pub state_machine: Arc<ReplicatedStateMachine>,
    pub fatal: FatalSignal,
}

impl TestNode {
    pub fn dump(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.state_machine.tables().dump().expect("dump store")
    }

    pub fn tables(&self) -> TableStore {
        self.state_machine.tables().clone()
    }
}

pub fn raft_addr(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

/// Config for node `id` whose raft transport listens on `port`. The HTTP
/// and pg addresses are never bound by these tests.
pub fn node_config(id: u64, port: u16) -> NodeConfig {
    let mut config = NodeConfig::single(id, &raft_addr(port), "127.0.0.1:0", "127.0.0.1:0");
    config.commit_timeout = Duration::from_secs(5);
    config
}

pub fn start_node(config: &NodeConfig) -> Result<TestNode> {
    let state_machine = Arc::new(ReplicatedStateMachine::new(TableStore::new(Arc::new(
        MemStore::new(),
    ))));
    let (raft, fatal) = spawn_node(config, state_machine.clone())?;
    Ok(TestNode {
        raft,
        state_machine,
        fatal,
    })
}

/// Starts nodes `1..=n` as one static cluster on ports `base_port..`.
pub fn spawn_cluster(n: usize, base_port: u16) -> Result<Vec<TestNode>> {
    let peers: BTreeMap<u64, String> = (0..n)
        .map(|i| (i as u64 + 1, raft_addr(base_port + i as u16)))
        .collect();
    let mut nodes = Vec::new();
    for i in 0..n {
        let mut config = node_config(i as u64 + 1, base_port + i as u16);
        config.peers = peers.clone();
        nodes.push(start_node(&config)?);
    }
    Ok(nodes)
}

pub fn shutdown(nodes: &[TestNode]) {
    for node in nodes {
        let _ = node.raft.shutdown();
    }
}

/// Polls `check` every 50ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while !check() {
        if start.elapsed() > timeout {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

pub async fn wait_for_role(raft: &RaftHandle, role: StateRole, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if raft.status().await?.role == role {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("timed out waiting for node {} to become {role:?}", raft.id());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Waits until `raft` knows `leader` as the current leader.
pub async fn wait_for_leader_id(raft: &RaftHandle, leader: u64, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    while raft.status().await?.leader_id != leader {
        if start.elapsed() > timeout {
            bail!("node {} never learned that node {leader} leads", raft.id());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

/// Waits until exactly one node leads and every node agrees on it.
pub async fn wait_for_single_leader(nodes: &[TestNode], timeout: Duration) -> Result<u64> {
    let start = Instant::now();
    loop {
        let mut leaders = Vec::new();
        let mut seen = Vec::new();
        for node in nodes {
            let status = node.raft.status().await?;
            if status.role == StateRole::Leader {
                leaders.push(status.node_id);
            }
            seen.push(status.leader_id);
        }
        if leaders.len() == 1 && seen.iter().all(|id| *id == leaders[0]) {
            return Ok(leaders[0]);
        }
        if start.elapsed() > timeout {
            bail!("no single leader after {timeout:?}: leaders {leaders:?}, seen {seen:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// A single self-electing node with the Postgres frontend on an ephemeral port.
pub async fn start_sql_node(raft_port: u16) -> Result<(SocketAddr, TestNode)> {
    let node = start_node(&node_config(1, raft_port))?;
    wait_for_role(&node.raft, StateRole::Leader, Duration::from_secs(5)).await?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let sessions = Arc::new(Frontend::new(node.tables(), node.raft.clone()));
    tokio::spawn(frontend::serve(listener, sessions));
    Ok((addr, node))
}

/// Everything the server sent for one simple query.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub columns: Vec<(String, u32)>,
    pub rows: Vec<Vec<Option<String>>>,
    pub tag: Option<String>,
    /// `(sqlstate, message)` of an `ErrorResponse`.
    pub error: Option<(String, String)>,
    pub empty: bool,
}

impl QueryResult {
    pub fn sqlstate(&self) -> Option<&str> {
        self.error.as_ref().map(|(code, _)| code.as_str())
    }
}

/// Bare-bones simple-query client.
pub struct PgClient {
    stream: TcpStream,
    pub parameters: BTreeMap<String, String>,
}

impl PgClient {
    /// Asks for SSL (expecting a refusal), then runs the startup handshake.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&8u32.to_be_bytes()).await?;
        stream.write_all(&80_877_103u32.to_be_bytes()).await?;
        let mut answer = [0u8; 1];
        stream.read_exact(&mut answer).await?;
        ensure!(answer[0] == b'N', "SSL request answered with {:?}", answer[0] as char);

        let mut body = Vec::new();
        body.extend_from_slice(&196_608u32.to_be_bytes());
        for part in ["user", "tester", "database", "test", ""] {
            body.extend_from_slice(part.as_bytes());
            body.push(0);
        }
        stream.write_all(&(body.len() as u32 + 4).to_be_bytes()).await?;
        stream.write_all(&body).await?;

        let mut client = Self {
            stream,
            parameters: BTreeMap::new(),
        };
        let (tag, _) = client.read_message().await?;
        ensure!(tag == b'R', "expected AuthenticationOk, got {:?}", tag as char);
        loop {
            let (tag, body) = client.read_message().await?;
            match tag {
                b'S' => {
                    let mut parts = cstrings(&body);
                    let name = parts.remove(0);
                    let value = parts.remove(0);
                    client.parameters.insert(name, value);
                }
                b'Z' => return Ok(client),
                other => bail!("unexpected {:?} during startup", other as char),
            }
        }
    }

    pub async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        self.send(b'Q', &[sql.as_bytes(), &[0u8][..]].concat()).await?;
        let mut result = QueryResult::default();
        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'T' => result.columns = row_description(&body),
                b'D' => result.rows.push(data_row(&body)),
                b'C' => result.tag = cstrings(&body).into_iter().next(),
                b'E' => result.error = Some(error_fields(&body)),
                b'I' => result.empty = true,
                b'Z' => return Ok(result),
                other => bail!("unexpected {:?} in query response", other as char),
            }
        }
    }

    /// Sends a raw frame, for messages the client does not otherwise speak.
    pub async fn send(&mut self, tag: u8, body: &[u8]) -> Result<()> {
        let mut frame = vec![tag];
        frame.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        frame.extend_from_slice(body);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<(u8, Vec<u8>)> {
        let tag = self.stream.read_u8().await?;
        let len = self.stream.read_u32().await? as usize;
        ensure!(len >= 4, "bad length {len}");
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).await?;
        Ok((tag, body))
    }

    /// Whether the server closed the connection.
    pub async fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(
            tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}

fn cstrings(body: &[u8]) -> Vec<String> {
    body.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

fn row_description(body: &[u8]) -> Vec<(String, u32)> {
    let count = i16::from_be_bytes([body[0], body[1]]) as usize;
    let mut at = 2;
    let mut columns = Vec::with_capacity(count);
    for _ in 0..count {
        let end = at + body[at..].iter().position(|b| *b == 0).expect("name terminator");
        let name = String::from_utf8_lossy(&body[at..end]).into_owned();
        at = end + 1 + 4 + 2;
        let oid = u32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);
        at += 4 + 2 + 4 + 2;
        columns.push((name, oid));
    }
    columns
}

fn data_row(body: &[u8]) -> Vec<Option<String>> {
    let count = i16::from_be_bytes([body[0], body[1]]) as usize;
    let mut at = 2;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let len = i32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);
        at += 4;
        if len < 0 {
            values.push(None);
        } else {
            let len = len as usize;
            values.push(Some(String::from_utf8_lossy(&body[at..at + len]).into_owned()));
            at += len;
        }
    }
    values
}

fn error_fields(body: &[u8]) -> (String, String) {
    let mut code = String::new();
    let mut message = String::new();
    for field in body.split(|b| *b == 0).filter(|f| !f.is_empty()) {
        let value = String::from_utf8_lossy(&field[1..]).into_owned();
        match field[0] {
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }
    (code, message)
}
