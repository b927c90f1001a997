//! Error taxonomy shared by the executor, the state machine and the frontend.
//!
//! Statement-level errors are reported to the client and leave the store
//! untouched. Consensus errors are retryable. `ReplicaApplyFailure` is the one
//! error that must never be swallowed: it stops the node.

use std::time::Duration;

use thiserror::Error;

/// Every failure a statement can hit between the wire and the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlError {
    #[error("syntax error: {0}")]
    Parse(String),

    #[error("relation \"{0}\" does not exist")]
    UnknownTable(String),

    #[error("relation \"{0}\" already exists")]
    DuplicateTable(String),

    #[error("column \"{0}\" does not exist")]
    UnknownField(String),

    #[error("column \"{0}\" specified more than once")]
    DuplicateColumn(String),

    #[error("column \"{column}\" is of type {expected} but the value is {found}")]
    DatatypeMismatch {
        column: String,
        expected: String,
        found: String,
    },

    #[error("INSERT into \"{table}\" has {found} values but the table has {expected} columns")]
    ColumnCountMismatch {
        table: String,
        expected: usize,
        found: usize,
    },

    #[error("unsupported value: {0}")]
    UnsupportedValueType(String),

    #[error("unsupported statement: {0}")]
    UnsupportedStatement(String),

    #[error("only one statement per request is supported, got {0}")]
    MultiStatementRejected(usize),

    #[error("consensus unavailable: {0}")]
    ConsensusUnavailable(String),

    #[error("write was not acknowledged within {0:?}")]
    CommitTimeout(Duration),

    #[error("replica apply failure: {0}")]
    ReplicaApplyFailure(String),

    #[error("snapshot restore is not supported, replay the log instead")]
    SnapshotUnsupported,

    #[error("storage error: {0}")]
    Storage(String),
}

impl SqlError {
    /// Whether the client may retry. The write may or may not have happened.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SqlError::ConsensusUnavailable(_) | SqlError::CommitTimeout(_)
        )
    }

    /// SQLSTATE code sent in the wire `ErrorResponse`.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Parse(_) => "42601",
            SqlError::UnknownTable(_) => "42P01",
            SqlError::DuplicateTable(_) => "42P07",
            SqlError::UnknownField(_) => "42703",
            SqlError::DuplicateColumn(_) => "42701",
            SqlError::DatatypeMismatch { .. } => "42804",
            SqlError::ColumnCountMismatch { .. } => "42601",
            SqlError::UnsupportedValueType(_)
            | SqlError::UnsupportedStatement(_)
            | SqlError::MultiStatementRejected(_)
            | SqlError::SnapshotUnsupported => "0A000",
            SqlError::ConsensusUnavailable(_) => "57P03",
            SqlError::CommitTimeout(_) => "57014",
            SqlError::ReplicaApplyFailure(_) | SqlError::Storage(_) => "XX000",
        }
    }
}

impl From<fjall::Error> for SqlError {
    fn from(err: fjall::Error) -> Self {
        SqlError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SqlError {
    fn from(err: serde_json::Error) -> Self {
        SqlError::Storage(format!("encoding: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_consensus_errors_are_retryable() {
        assert!(SqlError::ConsensusUnavailable("no leader".into()).is_retryable());
        assert!(SqlError::CommitTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!SqlError::UnknownTable("t".into()).is_retryable());
        assert!(!SqlError::ReplicaApplyFailure("bad entry".into()).is_retryable());
    }

    #[test]
    fn test_schema_errors_use_postgres_codes() {
        assert_eq!(SqlError::UnknownTable("t".into()).sqlstate(), "42P01");
        assert_eq!(SqlError::DuplicateTable("t".into()).sqlstate(), "42P07");
        assert_eq!(SqlError::UnknownField("c".into()).sqlstate(), "42703");
        assert_eq!(SqlError::DuplicateColumn("c".into()).sqlstate(), "42701");
    }
}
