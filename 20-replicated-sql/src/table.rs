//! Table and row layout on top of a [`KvStore`].
//!
//! Keys live in one namespace:
//!
//! - `table:<name>` holds the JSON-encoded [`TableDefinition`]
//! - `row:<name>:<row-id>` holds one JSON-encoded [`Row`]
//!
//! The write path and the scan path both derive row keys from
//! [`row_prefix`], so they cannot disagree about where a table's rows live.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SqlError;
use crate::store::{KvStore, WriteBatch};

const TABLE_PREFIX: &str = "table:";
const ROW_PREFIX: &str = "row:";

pub fn table_key(name: &str) -> Vec<u8> {
    format!("{TABLE_PREFIX}{name}").into_bytes()
}

pub fn row_prefix(name: &str) -> Vec<u8> {
    format!("{ROW_PREFIX}{name}:").into_bytes()
}

pub fn row_key(name: &str, id: RowId) -> Vec<u8> {
    let mut key = row_prefix(name);
    key.extend_from_slice(id.to_string().as_bytes());
    key
}

/// Schema of one table. Written once by CREATE, never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Catalog-qualified type name, e.g. `pg_catalog.int4` or `text`.
    #[serde(rename = "type")]
    pub type_name: String,
}

impl TableDefinition {
    /// Position and declared type of a column.
    pub fn column(&self, name: &str) -> Option<(usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, column)| column.name == name)
    }
}

/// A typed scalar. Serialized untagged so a stored row reads `["alice",30]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{i}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Values positionally aligned with the owning table's columns.
pub type Row = Vec<Value>;

/// Row identifier derived from where the row was created in the raft log.
///
/// Every replica applies the same entry at the same index, so every replica
/// computes the same id. The textual form is fixed width, which makes key
/// order match `(index, offset)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId {
    pub index: u64,
    pub offset: u32,
}

impl RowId {
    pub fn new(index: u64, offset: u32) -> Self {
        Self { index, offset }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (index, offset) = s.split_once('-')?;
        if index.len() != 20 || offset.len() != 10 {
            return None;
        }
        if !index.bytes().chain(offset.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            index: index.parse().ok()?,
            offset: offset.parse().ok()?,
        })
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:020}-{:010}", self.index, self.offset)
    }
}

/// Typed access to tables and rows. Cheap to clone; all clones share the store.
#[derive(Clone)]
pub struct TableStore {
    kv: Arc<dyn KvStore>,
}

impl TableStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn table(&self, name: &str) -> Result<Option<TableDefinition>, SqlError> {
        match self.kv.get(&table_key(name))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All rows of `name` in row-id order.
    pub fn rows(&self, name: &str) -> Result<Vec<(RowId, Row)>, SqlError> {
        let prefix = row_prefix(name);
        let mut rows = Vec::new();
        for (key, value) in self.kv.scan_prefix(&prefix)? {
            // Rows of a table named `<name>:<more>` share the prefix but not the id shape.
            let Some(id) = std::str::from_utf8(&key[prefix.len()..])
                .ok()
                .and_then(RowId::parse)
            else {
                continue;
            };
            rows.push((id, serde_json::from_slice(&value)?));
        }
        Ok(rows)
    }

    pub fn stage_table(batch: &mut WriteBatch, table: &TableDefinition) -> Result<(), SqlError> {
        batch.put(table_key(&table.name), serde_json::to_vec(table)?);
        Ok(())
    }

    pub fn stage_row(
        batch: &mut WriteBatch,
        table: &str,
        id: RowId,
        row: &Row,
    ) -> Result<(), SqlError> {
        batch.put(row_key(table, id), serde_json::to_vec(row)?);
        Ok(())
    }

    pub fn commit(&self, batch: WriteBatch) -> Result<(), SqlError> {
        self.kv.commit(batch)
    }

    /// Every key/value pair, in key order.
    pub fn dump(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SqlError> {
        self.kv.scan_prefix(b"")
    }
}
