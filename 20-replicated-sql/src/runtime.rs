//! Threads around a [`RaftNode`]: the worker that owns it and the raft transport.
//!
//! - **Worker thread**: owns the [`RaftNode`], runs the event loop and is the
//!   only place entries are applied
//! - **Network listener thread**: accepts TCP connections from peers
//! - **Connection handler threads**: read one message and forward it to the worker
//!
//! Everything else talks to the worker through a [`RaftHandle`]. Requests go in
//! over crossbeam channels and answers come back on tokio oneshots, so async
//! callers can await them without blocking a runtime thread.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};
use prost::Message as ProstMessage;
use raft::StateRole;
use raft::prelude::{Message, MessageType};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::command::{Command, ProposalId};
use crate::config::NodeConfig;
use crate::error::SqlError;
use crate::executor::Outcome;
use crate::node::{ApplyReport, MemberAdded, RaftNode};
use crate::state_machine::{ReplicatedStateMachine, Verdict};

/// Interval between raft ticks.
///
/// Heartbeats go out every 3 ticks (300ms) and elections start after 10 to 20
/// ticks without hearing from a leader.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Point-in-time view of a node, as reported by `status`.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: u64,
    pub role: StateRole,
    pub leader_id: u64,
    pub term: u64,
    pub applied_index: u64,
    pub peers: BTreeMap<u64, String>,
}

/// Handle for sending requests to a running Raft node. Cheap to clone.
#[derive(Clone)]
pub struct RaftHandle {
    id: u64,
    request_tx: Sender<Request>,
    commit_timeout: Duration,
    next_seq: Arc<AtomicU64>,
}

impl RaftHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replicates `command` and waits until this node has applied it.
    ///
    /// Returns the verdict the state machine reached for the entry. Fails with
    /// `ConsensusUnavailable` when this node cannot get the entry committed
    /// (not the leader, leadership lost, worker stopped) and `CommitTimeout`
    /// when the commit takes longer than the configured timeout. Both leave
    /// the outcome of the write unknown.
    pub async fn propose(&self, command: Command) -> Result<Outcome, SqlError> {
        let proposal = ProposalId {
            node_id: self.id,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let (respond_to, response) = oneshot::channel();
        self.send(Request::Propose {
            proposal,
            command,
            respond_to,
        })?;
        self.await_commit(response).await?
    }

    /// Adds a voter reachable at `addr` and waits until the change is applied
    /// on this node.
    pub async fn add_member(&self, id: u64, addr: String) -> Result<(), SqlError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Request::AddMember {
            id,
            addr,
            respond_to,
        })?;
        self.await_commit(response).await?
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (respond_to, response) = oneshot::channel();
        self.request_tx
            .send(Request::Status { respond_to })
            .context("failed to send status request")?;
        response.await.context("status response channel closed")
    }

    /// Starts an election on this node now.
    pub async fn campaign(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.request_tx
            .send(Request::Campaign { respond_to })
            .context("failed to send campaign request")?;
        response.await.context("campaign response channel closed")?
    }

    /// Signals the worker to shut down.
    pub fn shutdown(&self) -> Result<()> {
        self.request_tx
            .send(Request::Shutdown)
            .context("failed to send shutdown")?;
        Ok(())
    }

    fn send(&self, request: Request) -> Result<(), SqlError> {
        self.request_tx
            .send(request)
            .map_err(|_| SqlError::ConsensusUnavailable("raft worker has stopped".to_string()))
    }

    async fn await_commit<T>(&self, response: oneshot::Receiver<T>) -> Result<T, SqlError> {
        match tokio::time::timeout(self.commit_timeout, response).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(SqlError::ConsensusUnavailable(
                "raft worker dropped the request".to_string(),
            )),
            Err(_) => Err(SqlError::CommitTimeout(self.commit_timeout)),
        }
    }
}

/// Requests sent to the worker thread.
enum Request {
    Propose {
        proposal: ProposalId,
        command: Command,
        respond_to: oneshot::Sender<Verdict>,
    },
    AddMember {
        id: u64,
        addr: String,
        respond_to: oneshot::Sender<Result<(), SqlError>>,
    },
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Campaign {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Resolves once the worker thread stops because of an error.
///
/// A clean shutdown drops the sender instead, so the receiver sees `Err`.
pub type FatalSignal = oneshot::Receiver<anyhow::Error>;

/// Starts the worker and transport for one node.
///
/// Binds the raft listener, starts the worker and, when this node is the
/// only voter, campaigns straight away so a fresh single-node cluster has a
/// leader without waiting for an election timeout.
pub fn spawn_node(
    config: &NodeConfig,
    state_machine: Arc<ReplicatedStateMachine>,
) -> Result<(RaftHandle, FatalSignal)> {
    config.validate()?;
    let voters = config.voters();
    let mut node = RaftNode::new(config.id, &voters, state_machine)?;
    if voters == [config.id] {
        node.campaign()?;
    }

    let (request_tx, request_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();
    let (fatal_tx, fatal_rx) = oneshot::channel();

    spawn_network_listener(&config.raft_addr, network_tx)?;

    let mut peers = config.peers.clone();
    peers.insert(config.id, config.raft_addr.clone());
    let mut worker = Worker::new(node, peers, request_rx, network_rx);
    let id = config.id;
    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = worker.run() {
                error!(node = id, error = %format!("{err:#}"), "raft worker stopped");
                let _ = fatal_tx.send(err);
            }
        })
        .context("failed to spawn raft worker")?;

    info!(node = id, raft = %config.raft_addr, ?voters, "raft node started");
    Ok((
        RaftHandle {
            id,
            request_tx,
            commit_timeout: config.commit_timeout,
            next_seq: Arc::new(AtomicU64::new(1)),
        },
        fatal_rx,
    ))
}

/// Owns the raft node and everything waiting on it.
///
/// Processes three kinds of events, whichever arrives first:
/// 1. **Requests** from [`RaftHandle`]s
/// 2. **Network messages** (Raft protocol) from peers
/// 3. **Ticks** every 100ms to drive Raft timeouts
struct Worker {
    node: RaftNode,
    peers: BTreeMap<u64, String>,
    request_rx: Receiver<Request>,
    network_rx: Receiver<Message>,
    pending: HashMap<ProposalId, oneshot::Sender<Verdict>>,
    pending_members: HashMap<u64, oneshot::Sender<Result<(), SqlError>>>,
    last_role: StateRole,
}

impl Worker {
    fn new(
        node: RaftNode,
        peers: BTreeMap<u64, String>,
        request_rx: Receiver<Request>,
        network_rx: Receiver<Message>,
    ) -> Self {
        let last_role = node.role();
        Self {
            node,
            peers,
            request_rx,
            network_rx,
            pending: HashMap::new(),
            pending_members: HashMap::new(),
            last_role,
        }
    }

    /// Runs the event loop until shutdown or a fatal error.
    ///
    /// On a fatal error every waiting client is told the replica failed
    /// before the error is returned.
    fn run(&mut self) -> Result<()> {
        let result = self.event_loop();
        if let Err(err) = &result {
            let reason = format!("{err:#}");
            self.fail_pending(|| SqlError::ReplicaApplyFailure(reason.clone()));
        }
        result
    }

    fn event_loop(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::from_secs(0));

            crossbeam_channel::select! {
                recv(self.request_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_request(req)? {
                                break;
                            }
                        }
                        Err(_) => break, // every handle dropped
                    }
                }
                recv(self.network_rx) -> msg => {
                    match msg {
                        Ok(msg) => {
                            if let Err(err) = self.node.step(msg) {
                                debug!(node = self.node.id(), error = %err, "dropping peer message");
                            }
                        }
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                self.prune_abandoned();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.check_role_change();
        }
        info!(node = self.node.id(), "raft worker shut down");
        Ok(())
    }

    /// Handles one request. Returns `false` once shutdown was requested.
    fn handle_request(&mut self, req: Request) -> Result<bool> {
        match req {
            Request::Propose {
                proposal,
                command,
                respond_to,
            } => match self.node.propose(proposal, &command) {
                Ok(()) => {
                    debug!(node = self.node.id(), seq = proposal.seq, sql = %command.sql, "proposed");
                    self.pending.insert(proposal, respond_to);
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            Request::AddMember {
                id,
                addr,
                respond_to,
            } => match self.node.propose_add_member(id, &addr) {
                Ok(()) => {
                    info!(node = self.node.id(), member = id, %addr, "proposed new member");
                    self.pending_members.insert(id, respond_to);
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            Request::Status { respond_to } => {
                let _ = respond_to.send(NodeStatus {
                    node_id: self.node.id(),
                    role: self.node.role(),
                    leader_id: self.node.leader_id(),
                    term: self.node.term(),
                    applied_index: self.node.applied_index(),
                    peers: self.peers.clone(),
                });
            }
            Request::Campaign { respond_to } => {
                let result = self.node.campaign();
                if result.is_ok() {
                    info!(node = self.node.id(), role = ?self.node.role(), "campaign started");
                }
                let _ = respond_to.send(result);
            }
            Request::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    /// Drains all ready state from Raft.
    ///
    /// New members are recorded before messages go out, so the first message
    /// to a freshly added node already has an address to go to.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for member in bundle.members {
                self.add_peer(member);
            }
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for report in bundle.applied {
                self.complete(report);
            }
        }
        Ok(())
    }

    fn add_peer(&mut self, member: MemberAdded) {
        info!(node = self.node.id(), member = member.id, addr = %member.addr, "member added");
        self.peers.insert(member.id, member.addr);
        if let Some(waiter) = self.pending_members.remove(&member.id) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Routes one outbound message. Messages to self are stepped locally.
    /// Raft is told whether a snapshot got through so it can retry on failure.
    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }

        let to = msg.to;
        let Some(addr) = self.peers.get(&to) else {
            warn!(node = self.node.id(), peer = to, "no address for peer, dropping message");
            return Ok(());
        };
        let is_snapshot = msg.msg_type() == MessageType::MsgSnapshot;
        let delivered = send_message(addr, &msg);
        if is_snapshot {
            self.node.report_snapshot(to, delivered);
        }
        Ok(())
    }

    /// Wakes the client waiting on an applied entry, if it was proposed here.
    fn complete(&mut self, report: ApplyReport) {
        debug!(
            node = self.node.id(),
            index = report.index,
            term = report.term,
            ok = report.verdict.is_ok(),
            "entry applied"
        );
        let Some(proposal) = report.proposal else {
            return;
        };
        if let Some(waiter) = self.pending.remove(&proposal) {
            let _ = waiter.send(report.verdict);
        }
    }

    /// Drops waiters whose client already gave up.
    fn prune_abandoned(&mut self) {
        self.pending.retain(|_, waiter| !waiter.is_closed());
        self.pending_members.retain(|_, waiter| !waiter.is_closed());
    }

    /// A leader that steps down cannot vouch for anything it has in flight.
    fn check_role_change(&mut self) {
        let current = self.node.role();
        if current == self.last_role {
            return;
        }
        info!(
            node = self.node.id(),
            from = ?self.last_role,
            to = ?current,
            leader = self.node.leader_id(),
            term = self.node.term(),
            "role changed"
        );
        if self.last_role == StateRole::Leader {
            let id = self.node.id();
            self.fail_pending(|| {
                SqlError::ConsensusUnavailable(format!("node {id} lost leadership"))
            });
        }
        self.last_role = current;
    }

    fn fail_pending(&mut self, err: impl Fn() -> SqlError) {
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(err()));
        }
        for (_, waiter) in self.pending_members.drain() {
            let _ = waiter.send(Err(err()));
        }
    }
}

/// Accepts peer connections on `addr` in a background thread.
///
/// Each accepted connection gets a short-lived handler thread that reads one
/// message and forwards it to the worker.
fn spawn_network_listener(addr: &str, tx: Sender<Message>) -> Result<()> {
    let listener =
        TcpListener::bind(addr).with_context(|| format!("failed to bind raft listener {addr}"))?;
    thread::Builder::new()
        .name(format!("raft-net-listener-{addr}"))
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                debug!(error = %err, "raft connection error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "raft accept error"),
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn network listener")
}

/// Reads one message off a peer connection and queues it for the worker.
///
/// Messages are length-prefixed: 4 bytes big-endian length, then the
/// protobuf-encoded `Message`.
fn handle_connection(mut stream: TcpStream, tx: Sender<Message>) -> Result<()> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    let msg =
        Message::decode(&buf[..]).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    tx.send(msg).map_err(|_| anyhow!("worker gone"))?;
    Ok(())
}

/// Sends a Raft message to a peer over a fresh connection. Returns whether
/// the bytes were written.
fn send_message(addr: &str, msg: &Message) -> bool {
    let bytes = msg.encode_to_vec();
    match try_send(addr, &bytes) {
        Ok(()) => true,
        Err(err) => {
            debug!(peer = addr, error = %err, "failed to send raft message");
            false
        }
    }
}

fn try_send(addr: &str, bytes: &[u8]) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr)?;
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(bytes)?;
    Ok(())
}
