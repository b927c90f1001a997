//! Raft node wrapping tikv/raft.
//!
//! [`RaftNode`] combines a `RawNode` with the [`ReplicatedStateMachine`]: every
//! committed normal entry is handed to the state machine in log order, and
//! every committed configuration change updates the membership.

use std::sync::{Arc, RwLockWriteGuard};

use anyhow::{Context, Result, bail};
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, Message, RawNode, Snapshot,
};
use raft::storage::{MemStorage, MemStorageCore};
use raft::{GetEntriesContext, RaftState, SnapshotStatus, StateRole, Storage};
use slog::{Logger, o};

use crate::command::{Command, ProposalId};
use crate::error::SqlError;
use crate::state_machine::{ReplicatedStateMachine, Verdict};

/// The raft library insists on an slog logger. Application logging goes
/// through `tracing`, so raft's own output is discarded.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Result of applying one committed SQL entry on this node.
///
/// `proposal` is set when the entry carried a proposal id, which lets the
/// node that proposed it wake up the waiting client.
#[derive(Debug)]
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
    pub proposal: Option<ProposalId>,
    pub verdict: Verdict,
}

/// A voter added by a committed configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAdded {
    pub id: u64,
    pub addr: String,
}

/// Everything one pass over Ready + LightReady produced.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
    pub members: Vec<MemberAdded>,
}

/// Raft log storage that is never compacted.
///
/// The state machine declines to produce snapshots, so a node that is missing
/// entries must replay them. When raft asks for a snapshot (a brand new member
/// has an empty log) this storage hands out one that sits at the very start of
/// the log and carries only the current membership. The receiver installs it
/// and the leader then streams every entry after it.
#[derive(Clone)]
pub struct LogStorage {
    log: MemStorage,
    state_machine: Arc<ReplicatedStateMachine>,
}

impl LogStorage {
    fn new(log: MemStorage, state_machine: Arc<ReplicatedStateMachine>) -> Self {
        Self { log, state_machine }
    }

    fn wl(&self) -> RwLockWriteGuard<'_, MemStorageCore> {
        self.log.wl()
    }
}

impl Storage for LogStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.log.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.log.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.log.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.log.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.log.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let mut snapshot = self.log.snapshot(request_index, to)?;
        let start = self.log.first_index()? - 1;
        let term = self.log.term(start)?;
        let meta = snapshot.mut_metadata();
        meta.index = start;
        meta.term = term;
        if let Some(data) = self.state_machine.snapshot() {
            snapshot.data = data.into();
        }
        Ok(snapshot)
    }
}

/// A Raft consensus node driving the replicated SQL state machine.
///
/// The node exposes a small interface: `propose` and `propose_add_member` to
/// submit work, `step` to feed peer messages, `poll_ready` to advance.
pub struct RaftNode {
    id: u64,
    raw: RawNode<LogStorage>,
    storage: LogStorage,
    state_machine: Arc<ReplicatedStateMachine>,
}

impl RaftNode {
    /// Creates a node.
    ///
    /// With a non-empty `voters` list the node starts as a member of that
    /// configuration. With an empty list it starts outside any configuration
    /// and waits for a leader to add it and ship it the log.
    ///
    /// With 100ms ticks, a leader heartbeats every 300ms and followers call an
    /// election after one to two seconds of silence.
    pub fn new(
        id: u64,
        voters: &[u64],
        state_machine: Arc<ReplicatedStateMachine>,
    ) -> Result<Self> {
        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        let log = MemStorage::new();
        if !voters.is_empty() {
            // Founding members share a synthetic snapshot at index 1, so the
            // log proper starts at 2 and anyone added later has to receive
            // the membership through a snapshot before replaying entries.
            let mut bootstrap = Snapshot::default();
            let meta = bootstrap.mut_metadata();
            meta.index = 1;
            meta.term = 1;
            meta.set_conf_state(ConfState::from((voters.to_vec(), vec![])));
            log.wl()
                .apply_snapshot(bootstrap)
                .context("failed to install bootstrap snapshot")?;
        }
        let storage = LogStorage::new(log, state_machine.clone());
        let logger = silent_logger();
        let raw = RawNode::new(&cfg, storage.clone(), &logger)
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self {
            id,
            raw,
            storage,
            state_machine,
        })
    }

    /// One logical clock step; the runtime calls this every 100ms.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Campaigns for leadership right away instead of waiting for a timeout.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Known leader, 0 while there is none.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    /// Index of the last SQL entry the state machine applied.
    pub fn applied_index(&self) -> u64 {
        self.state_machine.applied_index()
    }

    pub fn state_machine(&self) -> &Arc<ReplicatedStateMachine> {
        &self.state_machine
    }

    fn require_leader(&self) -> Result<(), SqlError> {
        if self.role() == StateRole::Leader {
            return Ok(());
        }
        let leader = match self.leader_id() {
            0 => "no leader is known".to_string(),
            id => format!("the leader is node {id}"),
        };
        Err(SqlError::ConsensusUnavailable(format!(
            "node {} is not the leader, {leader}",
            self.id
        )))
    }

    /// Appends a SQL command to the log. Only the leader accepts proposals.
    ///
    /// Success means "appended locally", not "committed". The matching
    /// [`ApplyReport`] shows up from `poll_ready` once the entry commits.
    pub fn propose(&mut self, proposal: ProposalId, command: &Command) -> Result<(), SqlError> {
        self.require_leader()?;
        self.raw
            .propose(proposal.encode(), command.encode())
            .map_err(|err| SqlError::ConsensusUnavailable(format!("propose failed: {err}")))
    }

    /// Proposes adding `id` as a voter reachable at `addr`.
    pub fn propose_add_member(&mut self, id: u64, addr: &str) -> Result<(), SqlError> {
        self.require_leader()?;
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = id;
        cc.context = addr.as_bytes().to_vec().into();
        self.raw
            .propose_conf_change(vec![], cc)
            .map_err(|err| SqlError::ConsensusUnavailable(format!("conf change failed: {err}")))
    }

    /// Feeds a message received from a peer.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Tells raft whether a snapshot message reached its destination.
    pub fn report_snapshot(&mut self, to: u64, delivered: bool) {
        let status = if delivered {
            SnapshotStatus::Finish
        } else {
            SnapshotStatus::Failure
        };
        self.raw.report_snapshot(to, status);
    }

    /// Persists, applies and collects whatever raft has ready.
    ///
    /// Returns `None` if there is nothing to do. An error here means the node
    /// can no longer follow the log (a failed apply, a snapshot that cannot be
    /// restored) and must stop.
    ///
    /// Follows raft's two-phase protocol: Ready carries what must be durable
    /// before messages go out, LightReady carries what became committed once
    /// the Ready was acknowledged.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut bundle = ReadyBundle {
            messages: Vec::new(),
            applied: Vec::new(),
            members: Vec::new(),
        };

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            if !snapshot.data.is_empty() {
                self.state_machine
                    .restore(&snapshot.data)
                    .context("restore snapshot failed")?;
            }
            self.storage
                .wl()
                .apply_snapshot(snapshot)
                .context("apply snapshot failed")?;
        }

        if !ready.entries().is_empty() {
            self.storage
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }

        if let Some(hard_state) = ready.hs() {
            self.storage.wl().set_hardstate(hard_state.clone());
        }

        bundle.messages.extend(ready.take_messages());
        self.apply_entries(ready.take_committed_entries(), &mut bundle)?;
        bundle.messages.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }

        bundle.messages.extend(light_ready.take_messages());
        self.apply_entries(light_ready.take_committed_entries(), &mut bundle)?;

        self.raw.advance_apply();

        Ok(Some(bundle))
    }

    /// Applies committed entries in log order.
    ///
    /// Empty entries (the no-op a new leader appends) carry no command and are
    /// skipped.
    fn apply_entries(&mut self, entries: Vec<Entry>, bundle: &mut ReadyBundle) -> Result<()> {
        for entry in entries {
            if entry.data.is_empty() {
                continue;
            }
            match entry.entry_type() {
                EntryType::EntryNormal => {
                    let verdict = self.state_machine.apply(entry.index, &entry.data)?;
                    bundle.applied.push(ApplyReport {
                        index: entry.index,
                        term: entry.term,
                        proposal: ProposalId::decode(&entry.context).ok(),
                        verdict,
                    });
                }
                EntryType::EntryConfChange => {
                    let cc = ConfChange::decode(&entry.data[..])
                        .with_context(|| format!("decode conf change at {}", entry.index))?;
                    let conf_state = self
                        .raw
                        .apply_conf_change(&cc)
                        .with_context(|| format!("apply conf change at {}", entry.index))?;
                    self.storage.wl().set_conf_state(conf_state);
                    if cc.change_type() == ConfChangeType::AddNode {
                        let addr = String::from_utf8(cc.context.to_vec())
                            .with_context(|| format!("member address at {}", entry.index))?;
                        bundle.members.push(MemberAdded {
                            id: cc.node_id,
                            addr,
                        });
                    }
                }
                EntryType::EntryConfChangeV2 => {
                    bail!("unexpected joint configuration change at {}", entry.index)
                }
            }
        }
        Ok(())
    }
}
