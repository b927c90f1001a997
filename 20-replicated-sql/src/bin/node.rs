//! Runs one database node: raft transport, admin HTTP and the Postgres frontend.
//!
//! Start a single node and grow the cluster through the admin API:
//! ```bash
//! # Terminal 1: bootstraps a one-node cluster and elects itself
//! cargo run --bin node -- --node-id 1 --raft-port 7101 --http-port 8101 --pg-port 5433
//!
//! # Terminal 2: starts empty and waits to be added
//! cargo run --bin node -- --node-id 2 --raft-port 7102 --http-port 8102 --pg-port 5434 \
//!   --join --peer 1=127.0.0.1:7101
//!
//! curl -X POST localhost:8101/add_follower -H 'content-type: application/json' \
//!   -d '{"id": 2, "addr": "127.0.0.1:7102"}'
//!
//! psql -h localhost -p 5433 -c "CREATE TABLE users (name TEXT, age INT)"
//! psql -h localhost -p 5434 -c "SELECT name, age FROM users"
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueHint};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use replicated_sql::admin;
use replicated_sql::config::{NodeConfig, parse_peers};
use replicated_sql::frontend::{self, Frontend};
use replicated_sql::runtime::spawn_node;
use replicated_sql::state_machine::ReplicatedStateMachine;
use replicated_sql::store::{FjallStore, KvStore, MemStore};
use replicated_sql::table::TableStore;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a raft-replicated SQL node")]
struct Args {
    /// Numeric raft node ID
    #[arg(long)]
    node_id: u64,

    /// Host all listeners bind to
    #[arg(long, default_value = "127.0.0.1", value_hint = ValueHint::Hostname)]
    host: String,

    /// Port of the raft transport
    #[arg(long, default_value_t = 7101)]
    raft_port: u16,

    /// Port of the admin HTTP server
    #[arg(long, default_value_t = 8101)]
    http_port: u16,

    /// Port of the Postgres wire frontend
    #[arg(long, default_value_t = 5433)]
    pg_port: u16,

    /// Directory holding each node's table store
    #[arg(long, default_value = "data", value_hint = ValueHint::DirPath)]
    data_dir: PathBuf,

    /// Comma-separated raft peers: id=addr,id=addr,...
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Start empty and wait for an existing leader to add this node
    #[arg(long)]
    join: bool,

    /// Keep tables in memory instead of on disk
    #[arg(long)]
    in_memory: bool,

    /// How long a write may wait for its commit
    #[arg(long, default_value_t = 5000)]
    commit_timeout_ms: u64,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let raft_addr = format!("{}:{}", self.host, self.raft_port);
        let mut peers = parse_peers(&self.peer)?;
        if !self.join {
            peers.insert(self.node_id, raft_addr.clone());
        }
        let config = NodeConfig {
            id: self.node_id,
            raft_addr,
            http_addr: format!("{}:{}", self.host, self.http_port),
            pg_addr: format!("{}:{}", self.host, self.pg_port),
            peers,
            join: self.join,
            data_dir: self.data_dir,
            in_memory: self.in_memory,
            commit_timeout: Duration::from_millis(self.commit_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config()?;
    run(config).await
}

async fn run(config: NodeConfig) -> Result<()> {
    // The raft log lives in memory and restarts from scratch, so the tables
    // must too or a replayed INSERT would land on top of its own rows.
    let (kv, disk): (Arc<dyn KvStore>, Option<Arc<FjallStore>>) = if config.in_memory {
        (Arc::new(MemStore::new()) as Arc<dyn KvStore>, None)
    } else {
        let dir = config.store_dir();
        let store = Arc::new(
            FjallStore::open(&dir)
                .with_context(|| format!("failed to open store at {}", dir.display()))?,
        );
        store.clear().context("failed to wipe store")?;
        let kv: Arc<dyn KvStore> = store.clone();
        (kv, Some(store))
    };
    let tables = TableStore::new(kv);

    let state_machine = Arc::new(ReplicatedStateMachine::new(tables.clone()));
    let (raft, mut fatal) = spawn_node(&config, state_machine)?;

    let http = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind admin server {}", config.http_addr))?;
    let pg = TcpListener::bind(&config.pg_addr)
        .await
        .with_context(|| format!("failed to bind pg frontend {}", config.pg_addr))?;
    info!(
        node = config.id,
        raft = %config.raft_addr,
        http = %config.http_addr,
        pg = %config.pg_addr,
        "node ready"
    );

    let sessions = Arc::new(Frontend::new(tables, raft.clone()));
    let result = tokio::select! {
        res = &mut fatal => match res {
            Ok(err) => Err(err.context("raft worker failed")),
            Err(_) => Err(anyhow!("raft worker exited")),
        },
        res = frontend::serve(pg, sessions) => res,
        res = admin::serve(http, raft.clone()) => res,
        res = tokio::signal::ctrl_c() => {
            info!(node = config.id, "shutting down");
            res.context("failed to listen for ctrl-c")
        }
    };

    let _ = raft.shutdown();
    if let Some(store) = disk {
        store.persist().context("failed to flush store")?;
    }
    result
}
