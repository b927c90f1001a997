use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};

/// How long a client waits for its write to commit before giving up.
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a node needs to start. Built once by the binary (or a test)
/// and passed down explicitly.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's raft id.
    pub id: u64,
    /// Address the raft transport listens on.
    pub raft_addr: String,
    /// Address the admin HTTP server listens on.
    pub http_addr: String,
    /// Address the Postgres wire frontend listens on.
    pub pg_addr: String,
    /// Known raft addresses by node id. Without `join` these are the initial
    /// voters; with `join` they only tell this node how to reach the leader.
    pub peers: BTreeMap<u64, String>,
    /// Start outside any configuration and wait to be added.
    pub join: bool,
    /// Root directory for on-disk table stores.
    pub data_dir: PathBuf,
    /// Keep tables in memory instead of on disk.
    pub in_memory: bool,
    pub commit_timeout: Duration,
}

impl NodeConfig {
    /// A single-voter, in-memory node listening on the given addresses.
    pub fn single(id: u64, raft_addr: &str, http_addr: &str, pg_addr: &str) -> Self {
        let mut peers = BTreeMap::new();
        peers.insert(id, raft_addr.to_string());
        Self {
            id,
            raft_addr: raft_addr.to_string(),
            http_addr: http_addr.to_string(),
            pg_addr: pg_addr.to_string(),
            peers,
            join: false,
            data_dir: PathBuf::from("data"),
            in_memory: true,
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        }
    }

    /// Initial voters. Empty for a joining node.
    pub fn voters(&self) -> Vec<u64> {
        if self.join {
            return Vec::new();
        }
        let mut voters: Vec<u64> = self.peers.keys().copied().collect();
        if !voters.contains(&self.id) {
            voters.push(self.id);
            voters.sort_unstable();
        }
        voters
    }

    /// Directory of this node's table store.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join(format!("node-{}", self.id))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.id != 0, "node id 0 is reserved by raft");
        if let Some(addr) = self.peers.get(&self.id) {
            ensure!(
                addr == &self.raft_addr,
                "peer entry {}={addr} disagrees with raft address {}",
                self.id,
                self.raft_addr
            );
        }
        if self.join {
            ensure!(
                self.peers.keys().any(|id| *id != self.id),
                "--join needs a --peer entry for at least one existing member"
            );
        }
        Ok(())
    }
}

/// Parses `id=addr` entries into a peer map.
pub fn parse_peers(entries: &[String]) -> Result<BTreeMap<u64, String>> {
    let mut peers = BTreeMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow!("invalid peer entry '{entry}', expected id=addr"));
        };
        let id: u64 = id_str
            .trim()
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        peers.insert(id, addr.trim().to_string());
    }
    Ok(peers)
}
