//! Parsed statement tree.
//!
//! SQL text goes through `sqlparser` (PostgreSQL dialect) and is lowered into
//! the small closed [`Statement`] enum the executor understands. Anything the
//! executor cannot run becomes [`Statement::Unsupported`] instead of a partial
//! match somewhere deeper in the engine.

use sqlparser::ast::{
    self, DataType, Expr, GroupByExpr, ObjectName, SelectItem as AstSelectItem, SetExpr,
    TableFactor, TableObject, UnaryOperator,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::SqlError;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Create(CreateTable),
    Insert(Insert),
    Select(Select),
    /// Parsed fine, but not something this engine runs. Holds a short description.
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTable {
    pub name: String,
    /// `(column name, catalog-qualified type name)` in declaration order.
    pub columns: Vec<(String, String)>,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    /// Explicit column list, empty when the statement has none.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Literal>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Integer(i64),
    /// Any other expression, kept as SQL text for the error message.
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub projection: Vec<SelectItem>,
    pub from: Vec<String>,
    /// Set when the query uses something beyond a bare projection over one table.
    pub unsupported: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Column(String),
    Wildcard,
    Other(String),
}

impl Statement {
    /// Rejects shapes that could never apply, before they reach the log.
    ///
    /// Only checks that need no table state live here; schema checks happen in
    /// apply, where every replica sees the same state.
    pub fn check_shape(&self) -> Result<(), SqlError> {
        match self {
            Statement::Unsupported(kind) => Err(SqlError::UnsupportedStatement(kind.clone())),
            Statement::Insert(insert) => {
                for row in &insert.rows {
                    for literal in row {
                        if let Literal::Other(text) = literal {
                            return Err(SqlError::UnsupportedValueType(text.clone()));
                        }
                    }
                }
                Ok(())
            }
            Statement::Create(_) | Statement::Select(_) => Ok(()),
        }
    }
}

/// Parses exactly one statement.
pub fn parse(sql: &str) -> Result<Statement, SqlError> {
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|err| SqlError::Parse(err.to_string()))?;
    match statements.len() {
        0 => Err(SqlError::Parse("empty query".to_string())),
        1 => Ok(lower(statements.remove(0))),
        n => Err(SqlError::MultiStatementRejected(n)),
    }
}

fn lower(statement: ast::Statement) -> Statement {
    match statement {
        ast::Statement::CreateTable(create) => Statement::Create(CreateTable {
            name: object_name(&create.name),
            columns: create
                .columns
                .iter()
                .map(|column| (ident(&column.name), catalog_type(&column.data_type)))
                .collect(),
            if_not_exists: create.if_not_exists,
        }),
        ast::Statement::Insert(insert) => lower_insert(insert),
        ast::Statement::Query(query) => lower_query(*query),
        other => Statement::Unsupported(statement_kind(&other)),
    }
}

fn lower_insert(insert: ast::Insert) -> Statement {
    let table = match &insert.table {
        TableObject::TableName(name) => object_name(name),
        _ => return Statement::Unsupported("INSERT INTO a table function".to_string()),
    };
    let Some(source) = insert.source else {
        return Statement::Unsupported("INSERT without VALUES".to_string());
    };
    let source = *source;
    let SetExpr::Values(values) = *source.body else {
        return Statement::Unsupported("INSERT ... SELECT".to_string());
    };
    Statement::Insert(Insert {
        table,
        columns: insert.columns.iter().map(ident).collect(),
        rows: values
            .rows
            .iter()
            .map(|row| row.iter().map(literal).collect())
            .collect(),
    })
}

fn lower_query(query: ast::Query) -> Statement {
    let modifier = query_modifier(&query);
    let SetExpr::Select(select) = *query.body else {
        return Statement::Unsupported("set operation or VALUES query".to_string());
    };

    let mut unsupported = modifier.or_else(|| select_clause(&select)).map(str::to_string);

    let mut from = Vec::new();
    for item in &select.from {
        if !item.joins.is_empty() {
            unsupported = Some("joins".to_string());
        }
        match &item.relation {
            TableFactor::Table { name, .. } => from.push(object_name(name)),
            other => unsupported = Some(format!("FROM {other}")),
        }
    }

    let projection = select
        .projection
        .iter()
        .map(|item| match item {
            AstSelectItem::UnnamedExpr(Expr::Identifier(name)) => {
                SelectItem::Column(ident(name))
            }
            AstSelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => parts
                .last()
                .map(|name| SelectItem::Column(ident(name)))
                .unwrap_or_else(|| SelectItem::Other(item.to_string())),
            AstSelectItem::Wildcard(_) => SelectItem::Wildcard,
            other => SelectItem::Other(other.to_string()),
        })
        .collect();

    Statement::Select(Select {
        projection,
        from,
        unsupported,
    })
}

/// First clause around the query body that a bare projection cannot honor.
fn query_modifier(query: &ast::Query) -> Option<&'static str> {
    if query.with.is_some() {
        Some("WITH")
    } else if query.order_by.is_some() {
        Some("ORDER BY")
    } else if query.limit_clause.is_some() || query.fetch.is_some() {
        Some("LIMIT / OFFSET / FETCH")
    } else if !query.locks.is_empty() || query.for_clause.is_some() {
        Some("locking or FOR clause")
    } else if query.settings.is_some() || query.format_clause.is_some() {
        Some("SETTINGS or FORMAT clause")
    } else {
        None
    }
}

/// First clause of a SELECT, other than FROM and the projection, that is in use.
fn select_clause(select: &ast::Select) -> Option<&'static str> {
    let grouped = !matches!(
        &select.group_by,
        GroupByExpr::Expressions(exprs, _) if exprs.is_empty()
    );
    if select.distinct.is_some() {
        Some("DISTINCT")
    } else if select.top.is_some() {
        Some("TOP")
    } else if select.into.is_some() {
        Some("SELECT INTO")
    } else if select.selection.is_some() || select.prewhere.is_some() {
        Some("WHERE clause")
    } else if grouped {
        Some("GROUP BY")
    } else if select.having.is_some() {
        Some("HAVING")
    } else if !select.named_window.is_empty() || select.qualify.is_some() {
        Some("window clause")
    } else if !select.lateral_views.is_empty() {
        Some("LATERAL VIEW")
    } else if !select.cluster_by.is_empty()
        || !select.distribute_by.is_empty()
        || !select.sort_by.is_empty()
    {
        Some("CLUSTER / DISTRIBUTE / SORT BY")
    } else if select.connect_by.is_some() || select.value_table_mode.is_some() {
        Some("hierarchical or value-table query")
    } else {
        None
    }
}

fn literal(expr: &Expr) -> Literal {
    match expr {
        Expr::Value(value) => match &value.value {
            ast::Value::SingleQuotedString(s) => Literal::String(s.clone()),
            ast::Value::Number(n, _) => n
                .parse::<i64>()
                .map(Literal::Integer)
                .unwrap_or_else(|_| Literal::Other(n.clone())),
            other => Literal::Other(other.to_string()),
        },
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr: inner,
        } => match literal(inner) {
            Literal::Integer(i) => i
                .checked_neg()
                .map(Literal::Integer)
                .unwrap_or_else(|| Literal::Other(expr.to_string())),
            _ => Literal::Other(expr.to_string()),
        },
        other => Literal::Other(other.to_string()),
    }
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .last()
        .and_then(|part| part.as_ident())
        .map(ident)
        .unwrap_or_else(|| name.to_string())
}

/// Unquoted identifiers fold to lower case, as in Postgres.
fn ident(ident: &ast::Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

/// Catalog-qualified name of a declared column type, the way the Postgres
/// catalog spells it: `int` is `pg_catalog.int4`, `text` stays `text`.
pub fn catalog_type(data_type: &DataType) -> String {
    let qualified = |name: &str| format!("pg_catalog.{name}");
    match data_type {
        DataType::Int(_) | DataType::Integer(_) | DataType::Int4(_) => qualified("int4"),
        DataType::BigInt(_) | DataType::Int8(_) => qualified("int8"),
        DataType::SmallInt(_) | DataType::Int2(_) => qualified("int2"),
        DataType::Varchar(_) | DataType::CharacterVarying(_) => qualified("varchar"),
        DataType::Boolean | DataType::Bool => qualified("bool"),
        DataType::Text => "text".to_string(),
        DataType::Custom(name, _) => name
            .0
            .iter()
            .map(|part| part.to_string())
            .collect::<Vec<_>>()
            .join("."),
        other => other.to_string().to_lowercase(),
    }
}

fn statement_kind(statement: &ast::Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_uses_catalog_type_names() -> Result<(), SqlError> {
        let stmt = parse("CREATE TABLE users (name TEXT, age INT, big BIGINT)")?;
        assert_eq!(
            stmt,
            Statement::Create(CreateTable {
                name: "users".to_string(),
                columns: vec![
                    ("name".to_string(), "text".to_string()),
                    ("age".to_string(), "pg_catalog.int4".to_string()),
                    ("big".to_string(), "pg_catalog.int8".to_string()),
                ],
                if_not_exists: false,
            })
        );
        Ok(())
    }

    #[test]
    fn test_insert_literals_are_typed() -> Result<(), SqlError> {
        let stmt = parse("INSERT INTO users VALUES ('alice', 30), ('bob', -4)")?;
        let Statement::Insert(insert) = stmt else {
            panic!("expected insert, got {stmt:?}");
        };
        assert_eq!(insert.table, "users");
        assert_eq!(
            insert.rows,
            vec![
                vec![Literal::String("alice".into()), Literal::Integer(30)],
                vec![Literal::String("bob".into()), Literal::Integer(-4)],
            ]
        );
        Ok(())
    }

    #[test]
    fn test_insert_with_null_fails_shape_check() -> Result<(), SqlError> {
        let stmt = parse("INSERT INTO users VALUES ('alice', NULL)")?;
        assert!(matches!(
            stmt.check_shape(),
            Err(SqlError::UnsupportedValueType(_))
        ));
        Ok(())
    }

    #[test]
    fn test_select_projection_and_source() -> Result<(), SqlError> {
        let stmt = parse("SELECT name, age FROM users")?;
        assert_eq!(
            stmt,
            Statement::Select(Select {
                projection: vec![
                    SelectItem::Column("name".into()),
                    SelectItem::Column("age".into())
                ],
                from: vec!["users".into()],
                unsupported: None,
            })
        );
        Ok(())
    }

    #[test]
    fn test_create_if_not_exists_is_carried() -> Result<(), SqlError> {
        let Statement::Create(create) = parse("CREATE TABLE IF NOT EXISTS t (a int)")? else {
            panic!("expected create");
        };
        assert!(create.if_not_exists);
        Ok(())
    }

    #[test]
    fn test_select_clauses_mark_the_query_unsupported() -> Result<(), SqlError> {
        for sql in [
            "SELECT DISTINCT a FROM t",
            "SELECT a FROM t GROUP BY a",
            "SELECT a FROM t GROUP BY a HAVING a > 1",
            "SELECT a FROM t WINDOW w AS (ORDER BY a)",
            "SELECT a INTO u FROM t",
            "SELECT a FROM t ORDER BY a",
            "SELECT a FROM t LIMIT 1",
            "SELECT a FROM t OFFSET 1",
            "SELECT a FROM t FOR UPDATE",
            "WITH x AS (SELECT a FROM t) SELECT a FROM x",
        ] {
            let Statement::Select(select) = parse(sql)? else {
                panic!("expected select for {sql}");
            };
            assert!(select.unsupported.is_some(), "{sql} should be unsupported");
        }
        Ok(())
    }

    #[test]
    fn test_two_statements_are_rejected() {
        assert_eq!(
            parse("SELECT 1; SELECT 2;"),
            Err(SqlError::MultiStatementRejected(2))
        );
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        assert!(matches!(parse("SELEKT nope"), Err(SqlError::Parse(_))));
        assert!(matches!(parse("   "), Err(SqlError::Parse(_))));
    }

    #[test]
    fn test_other_statements_are_unsupported() -> Result<(), SqlError> {
        let stmt = parse("DROP TABLE users")?;
        assert!(matches!(stmt, Statement::Unsupported(_)));
        assert!(matches!(
            stmt.check_shape(),
            Err(SqlError::UnsupportedStatement(_))
        ));
        Ok(())
    }
}
