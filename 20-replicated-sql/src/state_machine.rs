//! The replicated state machine driven by raft.
//!
//! Raft calls [`ReplicatedStateMachine::apply`] once per committed entry, in
//! log order, on every node. Apply re-parses the entry's SQL text and runs it
//! through the [`Executor`].
//!
//! Two kinds of failure come out of apply and they are handled very
//! differently:
//!
//! - A statement the schema rejects (duplicate table, unknown column, ...) is
//!   a *verdict*. Every replica holds the same state at the same index, so
//!   every replica reaches the same verdict and writes nothing. The verdict is
//!   handed back to whoever proposed the entry.
//! - A payload that does not decode, an index that goes backwards, or a
//!   storage error is an [`ApplyFailure`]. The replica can no longer prove it
//!   matches its peers, so it halts and refuses every later entry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::SqlError;
use crate::executor::{Executor, Outcome};
use crate::statement::{self, Statement};
use crate::table::TableStore;

/// Result a committed statement had on the replicated state.
pub type Verdict = Result<Outcome, SqlError>;

/// A committed entry could not be applied. Fatal for the node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("entry {index}: {reason}")]
pub struct ApplyFailure {
    pub index: u64,
    pub reason: String,
}

impl From<ApplyFailure> for SqlError {
    fn from(failure: ApplyFailure) -> Self {
        SqlError::ReplicaApplyFailure(failure.to_string())
    }
}

/// Externally visible states. Only apply moves between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Empty,
    Populated,
}

pub struct ReplicatedStateMachine {
    executor: Executor,
    applied_index: AtomicU64,
    halted: AtomicBool,
}

impl ReplicatedStateMachine {
    pub fn new(tables: TableStore) -> Self {
        Self {
            executor: Executor::new(tables),
            applied_index: AtomicU64::new(0),
            halted: AtomicBool::new(false),
        }
    }

    /// Applies the committed entry at `index`.
    ///
    /// Must be called from a single thread, with strictly increasing indexes.
    pub fn apply(&self, index: u64, payload: &[u8]) -> Result<Verdict, ApplyFailure> {
        if self.halted.load(Ordering::Acquire) {
            return Err(ApplyFailure {
                index,
                reason: "state machine halted by an earlier failure".to_string(),
            });
        }
        let last = self.applied_index.load(Ordering::Acquire);
        if index <= last {
            return Err(self.halt(index, format!("index does not advance past {last}")));
        }

        let sql = match std::str::from_utf8(payload) {
            Ok(sql) => sql,
            Err(err) => return Err(self.halt(index, format!("payload is not UTF-8: {err}"))),
        };
        let statement = match statement::parse(sql) {
            Ok(statement) => statement,
            Err(err) => return Err(self.halt(index, format!("cannot decode command: {err}"))),
        };
        let statement = match statement {
            Statement::Select(_) => Statement::Unsupported("SELECT in the command log".to_string()),
            other => other,
        };

        let verdict = match self.executor.execute(&statement, index) {
            Err(SqlError::Storage(reason)) => {
                return Err(self.halt(index, format!("storage: {reason}")));
            }
            verdict => verdict,
        };
        self.applied_index.store(index, Ordering::Release);

        match &verdict {
            Ok(outcome) => debug!(index, tag = %outcome.command_tag(), "applied command"),
            Err(err) => warn!(index, error = %err, sql, "committed command rejected"),
        }
        Ok(verdict)
    }

    /// Point-in-time image for raft log compaction. Always declined: the store
    /// is durable on its own and a lagging node catches up by log replay.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        None
    }

    /// There is no snapshot format, so there is nothing to restore from.
    pub fn restore(&self, data: &[u8]) -> Result<(), SqlError> {
        warn!(bytes = data.len(), "rejecting snapshot restore");
        Err(SqlError::SnapshotUnsupported)
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn state(&self) -> Result<MachineState, SqlError> {
        if self.executor.tables().dump()?.is_empty() {
            Ok(MachineState::Empty)
        } else {
            Ok(MachineState::Populated)
        }
    }

    pub fn tables(&self) -> &TableStore {
        self.executor.tables()
    }

    fn halt(&self, index: u64, reason: String) -> ApplyFailure {
        self.halted.store(true, Ordering::Release);
        error!(index, %reason, "halting state machine");
        ApplyFailure { index, reason }
    }
}
