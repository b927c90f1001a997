//! Statement execution against the local table store.
//!
//! The executor knows nothing about raft or sockets. Given the same store
//! contents, the same statement and the same log index, it produces the same
//! writes on every node; that is all replication needs from it.

use tracing::debug;

use crate::error::SqlError;
use crate::statement::{CreateTable, Insert, Literal, Select, SelectItem, Statement};
use crate::store::WriteBatch;
use crate::table::{Column, Row, RowId, TableDefinition, TableStore, Value};

/// Declared types whose values must be integer literals.
const INTEGER_TYPES: [&str; 3] = ["pg_catalog.int2", "pg_catalog.int4", "pg_catalog.int8"];
/// Declared types whose values must be string literals.
const TEXT_TYPES: [&str; 2] = ["text", "pg_catalog.varchar"];

/// Rows produced by a SELECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSet {
    pub field_names: Vec<String>,
    pub field_types: Vec<String>,
    pub rows: Vec<Row>,
}

/// What a successfully executed statement did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created { table: String },
    Inserted { rows: usize },
    Rows(ResultSet),
}

impl Outcome {
    /// `CommandComplete` tag for this outcome.
    pub fn command_tag(&self) -> String {
        match self {
            Outcome::Created { .. } => "CREATE TABLE".to_string(),
            Outcome::Inserted { rows } => format!("INSERT 0 {rows}"),
            Outcome::Rows(result) => format!("SELECT {}", result.rows.len()),
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    tables: TableStore,
}

impl Executor {
    pub fn new(tables: TableStore) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &TableStore {
        &self.tables
    }

    /// Runs one statement. `index` is the log position the statement was
    /// committed at; it seeds row ids.
    pub fn execute(&self, statement: &Statement, index: u64) -> Result<Outcome, SqlError> {
        match statement {
            Statement::Create(create) => self.create_table(create),
            Statement::Insert(insert) => self.insert(insert, index),
            Statement::Select(select) => self.select(select).map(Outcome::Rows),
            Statement::Unsupported(kind) => Err(SqlError::UnsupportedStatement(kind.clone())),
        }
    }

    pub fn create_table(&self, create: &CreateTable) -> Result<Outcome, SqlError> {
        if self.tables.table(&create.name)?.is_some() {
            if create.if_not_exists {
                debug!(table = %create.name, "table exists, nothing to create");
                return Ok(Outcome::Created {
                    table: create.name.clone(),
                });
            }
            return Err(SqlError::DuplicateTable(create.name.clone()));
        }
        if create.columns.is_empty() {
            return Err(SqlError::UnsupportedStatement(
                "CREATE TABLE without columns".to_string(),
            ));
        }
        for (i, (name, _)) in create.columns.iter().enumerate() {
            if create.columns[..i].iter().any(|(earlier, _)| earlier == name) {
                return Err(SqlError::DuplicateColumn(name.clone()));
            }
        }
        let definition = TableDefinition {
            name: create.name.clone(),
            columns: create
                .columns
                .iter()
                .map(|(name, type_name)| Column {
                    name: name.clone(),
                    type_name: type_name.clone(),
                })
                .collect(),
        };

        let mut batch = WriteBatch::new();
        TableStore::stage_table(&mut batch, &definition)?;
        self.tables.commit(batch)?;
        debug!(table = %definition.name, columns = definition.columns.len(), "created table");
        Ok(Outcome::Created {
            table: definition.name,
        })
    }

    /// Inserts every row of the statement in one batch: either all rows land or none do.
    pub fn insert(&self, insert: &Insert, index: u64) -> Result<Outcome, SqlError> {
        let table = self
            .tables
            .table(&insert.table)?
            .ok_or_else(|| SqlError::UnknownTable(insert.table.clone()))?;
        let order = column_order(&table, &insert.columns)?;

        let mut batch = WriteBatch::new();
        for (offset, literals) in insert.rows.iter().enumerate() {
            if literals.len() != table.columns.len() {
                return Err(SqlError::ColumnCountMismatch {
                    table: table.name.clone(),
                    expected: table.columns.len(),
                    found: literals.len(),
                });
            }
            let mut row: Row = Vec::with_capacity(literals.len());
            for (column, &position) in table.columns.iter().zip(&order) {
                row.push(typed(column, &literals[position])?);
            }
            let offset = u32::try_from(offset).map_err(|_| {
                SqlError::UnsupportedStatement("too many rows in one INSERT".to_string())
            })?;
            TableStore::stage_row(&mut batch, &table.name, RowId::new(index, offset), &row)?;
        }

        let rows = batch.len();
        self.tables.commit(batch)?;
        debug!(table = %table.name, rows, index, "inserted rows");
        Ok(Outcome::Inserted { rows })
    }

    pub fn select(&self, select: &Select) -> Result<ResultSet, SqlError> {
        if let Some(reason) = &select.unsupported {
            return Err(SqlError::UnsupportedStatement(reason.clone()));
        }
        let name = match select.from.as_slice() {
            [name] => name,
            [] => {
                return Err(SqlError::UnsupportedStatement(
                    "SELECT without FROM".to_string(),
                ))
            }
            _ => {
                return Err(SqlError::UnsupportedStatement(
                    "more than one source table".to_string(),
                ))
            }
        };
        let table = self
            .tables
            .table(name)?
            .ok_or_else(|| SqlError::UnknownTable(name.clone()))?;

        let mut positions = Vec::new();
        let mut result = ResultSet {
            field_names: Vec::new(),
            field_types: Vec::new(),
            rows: Vec::new(),
        };
        for item in &select.projection {
            match item {
                SelectItem::Column(field) => {
                    let (position, column) = table
                        .column(field)
                        .ok_or_else(|| SqlError::UnknownField(field.clone()))?;
                    positions.push(position);
                    result.field_names.push(column.name.clone());
                    result.field_types.push(column.type_name.clone());
                }
                SelectItem::Wildcard => {
                    for (position, column) in table.columns.iter().enumerate() {
                        positions.push(position);
                        result.field_names.push(column.name.clone());
                        result.field_types.push(column.type_name.clone());
                    }
                }
                SelectItem::Other(expr) => {
                    return Err(SqlError::UnsupportedStatement(format!(
                        "projection `{expr}`"
                    )))
                }
            }
        }

        for (id, row) in self.tables.rows(&table.name)? {
            let mut projected = Vec::with_capacity(positions.len());
            for &position in &positions {
                let value = row.get(position).ok_or_else(|| {
                    SqlError::Storage(format!(
                        "row {id} of {} has {} values, expected {}",
                        table.name,
                        row.len(),
                        table.columns.len()
                    ))
                })?;
                projected.push(value.clone());
            }
            result.rows.push(projected);
        }
        Ok(result)
    }
}

/// For each table column, the index of the statement value that fills it.
fn column_order(table: &TableDefinition, columns: &[String]) -> Result<Vec<usize>, SqlError> {
    if columns.is_empty() {
        return Ok((0..table.columns.len()).collect());
    }
    if columns.len() != table.columns.len() {
        return Err(SqlError::ColumnCountMismatch {
            table: table.name.clone(),
            expected: table.columns.len(),
            found: columns.len(),
        });
    }
    let mut order = Vec::with_capacity(columns.len());
    for column in &table.columns {
        let position = columns
            .iter()
            .position(|name| *name == column.name)
            .ok_or_else(|| SqlError::UnknownField(column.name.clone()))?;
        order.push(position);
    }
    for name in columns {
        if table.column(name).is_none() {
            return Err(SqlError::UnknownField(name.clone()));
        }
    }
    Ok(order)
}

/// Tags a literal with its value kind, checked against the column's declared
/// type. Columns of any other declared type take either kind.
fn typed(column: &Column, literal: &Literal) -> Result<Value, SqlError> {
    let value = match literal {
        Literal::String(s) => Value::Text(s.clone()),
        Literal::Integer(i) => Value::Integer(*i),
        Literal::Other(text) => return Err(SqlError::UnsupportedValueType(text.clone())),
    };
    let declared = column.type_name.as_str();
    let mismatch = match &value {
        Value::Text(_) => INTEGER_TYPES.contains(&declared),
        Value::Integer(_) => TEXT_TYPES.contains(&declared),
    };
    if mismatch {
        return Err(SqlError::DatatypeMismatch {
            column: column.name.clone(),
            expected: declared.to_string(),
            found: match value {
                Value::Text(_) => "a string".to_string(),
                Value::Integer(_) => "an integer".to_string(),
            },
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::statement::parse;
    use crate::store::MemStore;

    fn executor() -> Executor {
        Executor::new(TableStore::new(Arc::new(MemStore::new())))
    }

    fn run(executor: &Executor, sql: &str, index: u64) -> Result<Outcome, SqlError> {
        executor.execute(&parse(sql)?, index)
    }

    fn select(executor: &Executor, sql: &str) -> Result<ResultSet, SqlError> {
        match run(executor, sql, 0)? {
            Outcome::Rows(result) => Ok(result),
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn test_insert_then_select_round_trip() -> Result<(), SqlError> {
        let ex = executor();
        run(&ex, "CREATE TABLE users (name text, age int4)", 1)?;
        run(&ex, "INSERT INTO users VALUES ('alice', 30)", 2)?;

        let result = select(&ex, "SELECT name, age FROM users")?;
        assert_eq!(result.field_names, vec!["name", "age"]);
        assert_eq!(result.field_types, vec!["text", "pg_catalog.int4"]);
        assert_eq!(
            result.rows,
            vec![vec![Value::Text("alice".into()), Value::Integer(30)]]
        );
        Ok(())
    }

    #[test]
    fn test_select_on_empty_table_has_header_and_no_rows() -> Result<(), SqlError> {
        let ex = executor();
        run(&ex, "CREATE TABLE users (name text, age int)", 1)?;
        let result = select(&ex, "SELECT age FROM users")?;
        assert_eq!(result.field_names, vec!["age"]);
        assert_eq!(result.field_types, vec!["pg_catalog.int4"]);
        assert!(result.rows.is_empty());
        Ok(())
    }

    #[test]
    fn test_rows_come_back_in_log_order() -> Result<(), SqlError> {
        let ex = executor();
        run(&ex, "CREATE TABLE t (n int)", 1)?;
        run(&ex, "INSERT INTO t VALUES (3), (4)", 12)?;
        run(&ex, "INSERT INTO t VALUES (1)", 2)?;
        let result = select(&ex, "SELECT n FROM t")?;
        assert_eq!(
            result.rows,
            vec![
                vec![Value::Integer(1)],
                vec![Value::Integer(3)],
                vec![Value::Integer(4)]
            ]
        );
        Ok(())
    }

    #[test]
    fn test_unknown_field_leaves_store_unchanged() -> Result<(), SqlError> {
        let ex = executor();
        run(&ex, "CREATE TABLE users (name text)", 1)?;
        let before = ex.tables().dump()?;
        assert_eq!(
            run(&ex, "SELECT email FROM users", 0),
            Err(SqlError::UnknownField("email".into()))
        );
        assert_eq!(ex.tables().dump()?, before);
        Ok(())
    }

    #[test]
    fn test_duplicate_and_unknown_tables() -> Result<(), SqlError> {
        let ex = executor();
        run(&ex, "CREATE TABLE users (name text)", 1)?;
        assert_eq!(
            run(&ex, "CREATE TABLE users (other int)", 2),
            Err(SqlError::DuplicateTable("users".into()))
        );
        assert_eq!(
            run(&ex, "INSERT INTO nobody VALUES (1)", 3),
            Err(SqlError::UnknownTable("nobody".into()))
        );
        assert_eq!(
            run(&ex, "SELECT name FROM nobody", 0),
            Err(SqlError::UnknownTable("nobody".into()))
        );
        Ok(())
    }

    #[test]
    fn test_bad_row_aborts_the_whole_insert() -> Result<(), SqlError> {
        let ex = executor();
        run(&ex, "CREATE TABLE users (name text, age int)", 1)?;
        let before = ex.tables().dump()?;

        let err = run(&ex, "INSERT INTO users VALUES ('a', 1), ('b', NULL)", 2);
        assert!(matches!(err, Err(SqlError::UnsupportedValueType(_))));
        let err = run(&ex, "INSERT INTO users VALUES ('a', 1), ('b')", 3);
        assert!(matches!(err, Err(SqlError::ColumnCountMismatch { .. })));

        assert_eq!(ex.tables().dump()?, before);
        Ok(())
    }

    #[test]
    fn test_explicit_column_list_is_reordered() -> Result<(), SqlError> {
        let ex = executor();
        run(&ex, "CREATE TABLE users (name text, age int)", 1)?;
        run(&ex, "INSERT INTO users (age, name) VALUES (41, 'carol')", 2)?;
        let result = select(&ex, "SELECT * FROM users")?;
        assert_eq!(
            result.rows,
            vec![vec![Value::Text("carol".into()), Value::Integer(41)]]
        );
        assert_eq!(
            run(&ex, "INSERT INTO users (age, email) VALUES (1, 'x')", 3),
            Err(SqlError::UnknownField("name".into()))
        );
        Ok(())
    }

    #[test]
    fn test_repeated_select_is_stable() -> Result<(), SqlError> {
        let ex = executor();
        run(&ex, "CREATE TABLE t (a text, b int)", 1)?;
        run(&ex, "INSERT INTO t VALUES ('x', 1), ('y', 2)", 2)?;
        let first = select(&ex, "SELECT b, a FROM t")?;
        let second = select(&ex, "SELECT b, a FROM t")?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_unsupported_select_shapes() -> Result<(), SqlError> {
        let ex = executor();
        run(&ex, "CREATE TABLE t (a int)", 1)?;
        assert!(matches!(
            run(&ex, "SELECT 1", 0),
            Err(SqlError::UnsupportedStatement(_))
        ));
        assert!(matches!(
            run(&ex, "SELECT a FROM t WHERE a = 1", 0),
            Err(SqlError::UnsupportedStatement(_))
        ));
        assert!(matches!(
            run(&ex, "SELECT a FROM t, t AS u", 0),
            Err(SqlError::UnsupportedStatement(_))
        ));
        Ok(())
    }

    #[test]
    fn test_aggregating_clauses_are_refused() -> Result<(), SqlError> {
        let ex = executor();
        run(&ex, "CREATE TABLE t (a int)", 1)?;
        run(&ex, "INSERT INTO t VALUES (1), (1), (2)", 2)?;
        for sql in [
            "SELECT DISTINCT a FROM t",
            "SELECT a FROM t GROUP BY a",
            "SELECT a FROM t GROUP BY a HAVING a > 1",
            "SELECT a FROM t ORDER BY a",
            "SELECT a FROM t LIMIT 1",
        ] {
            assert!(
                matches!(run(&ex, sql, 0), Err(SqlError::UnsupportedStatement(_))),
                "{sql} should be refused"
            );
        }
        assert_eq!(select(&ex, "SELECT a FROM t")?.rows.len(), 3);
        Ok(())
    }

    #[test]
    fn test_create_if_not_exists_keeps_the_first_definition() -> Result<(), SqlError> {
        let ex = executor();
        run(&ex, "CREATE TABLE t (a int)", 1)?;
        let before = ex.tables().dump()?;
        assert_eq!(
            run(&ex, "CREATE TABLE IF NOT EXISTS t (b text)", 2),
            Ok(Outcome::Created { table: "t".into() })
        );
        assert_eq!(ex.tables().dump()?, before);
        run(&ex, "CREATE TABLE IF NOT EXISTS u (b text)", 3)?;
        assert!(ex.tables().table("u")?.is_some());
        Ok(())
    }

    #[test]
    fn test_duplicate_column_names_are_rejected() -> Result<(), SqlError> {
        let ex = executor();
        assert_eq!(
            run(&ex, "CREATE TABLE d (a int, a text)", 1),
            Err(SqlError::DuplicateColumn("a".into()))
        );
        assert!(ex.tables().table("d")?.is_none());
        Ok(())
    }

    #[test]
    fn test_literals_must_match_declared_types() -> Result<(), SqlError> {
        let ex = executor();
        run(&ex, "CREATE TABLE users (name text, age int)", 1)?;
        let before = ex.tables().dump()?;

        let err = run(&ex, "INSERT INTO users VALUES ('alice', 'thirty')", 2);
        assert!(matches!(err, Err(SqlError::DatatypeMismatch { ref column, .. }) if column == "age"));
        let err = run(&ex, "INSERT INTO users (age, name) VALUES (30, 7)", 3);
        assert!(matches!(err, Err(SqlError::DatatypeMismatch { ref column, .. }) if column == "name"));
        assert_eq!(ex.tables().dump()?, before);

        // Types without a fixed literal kind accept either.
        run(&ex, "CREATE TABLE loose (v numeric)", 4)?;
        run(&ex, "INSERT INTO loose VALUES (1), ('two')", 5)?;
        assert_eq!(select(&ex, "SELECT v FROM loose")?.rows.len(), 2);
        Ok(())
    }

    #[test]
    fn test_command_tags() {
        assert_eq!(
            Outcome::Created { table: "t".into() }.command_tag(),
            "CREATE TABLE"
        );
        assert_eq!(Outcome::Inserted { rows: 2 }.command_tag(), "INSERT 0 2");
    }
}
