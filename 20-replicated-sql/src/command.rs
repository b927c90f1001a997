use anyhow::{Result, ensure};

/// A mutating statement on its way through the raft log.
///
/// The entry payload is the verbatim SQL text. Every replica re-parses it in
/// apply, so the log stays readable and independent of in-memory types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub sql: String,
}

impl Command {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.sql.as_bytes().to_vec()
    }
}

/// Identifies one proposal so the proposing node can find its own entry
/// among everything it applies. Travels in the raft entry context, never in
/// the payload, so it has no effect on replicated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProposalId {
    pub node_id: u64,
    pub seq: u64,
}

impl ProposalId {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.node_id.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() == 16, "proposal id must be 16 bytes, got {}", bytes.len());
        let (node, seq) = bytes.split_at(8);
        Ok(Self {
            node_id: u64::from_be_bytes(node.try_into()?),
            seq: u64::from_be_bytes(seq.try_into()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proposal_id_survives_entry_context() -> Result<()> {
        let id = ProposalId { node_id: 3, seq: 42 };
        assert_eq!(ProposalId::decode(&id.encode())?, id);
        assert!(ProposalId::decode(b"short").is_err());
        Ok(())
    }

    #[test]
    fn test_payload_is_the_sql_text() {
        let cmd = Command::new("INSERT INTO t VALUES (1)");
        assert_eq!(cmd.encode(), b"INSERT INTO t VALUES (1)".to_vec());
    }
}
