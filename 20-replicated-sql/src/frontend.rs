//! Postgres wire frontend.
//!
//! One task per client connection. Each query is parsed once and routed:
//! SELECT runs against the local store and never touches consensus, CREATE
//! and INSERT are proposed as raw SQL text and answered once this node has
//! applied them. Errors go back as `ErrorResponse` and the session carries on.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::error::SqlError;
use crate::executor::{Executor, Outcome, ResultSet};
use crate::protocol::{BackendMessage, FieldDescription, FrontendMessage, PgCodec, type_oid};
use crate::runtime::RaftHandle;
use crate::statement::{self, Statement};
use crate::table::TableStore;

/// Parameters reported to the client right after authentication.
const SERVER_PARAMETERS: &[(&str, &str)] = &[
    ("server_version", "14.0"),
    ("server_encoding", "UTF8"),
    ("client_encoding", "UTF8"),
    ("DateStyle", "ISO, MDY"),
];

/// Where mutating statements go to be ordered and applied.
pub trait Consensus: Send + Sync + 'static {
    /// Replicates `command` and resolves with the verdict this node reached
    /// when it applied the committed entry.
    fn propose(&self, command: Command) -> impl Future<Output = Result<Outcome, SqlError>> + Send;
}

impl Consensus for RaftHandle {
    fn propose(&self, command: Command) -> impl Future<Output = Result<Outcome, SqlError>> + Send {
        RaftHandle::propose(self, command)
    }
}

/// What a query produced, before wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Empty,
    Rows(ResultSet),
    Complete(String),
}

pub struct Frontend<C> {
    executor: Executor,
    consensus: C,
}

impl<C: Consensus> Frontend<C> {
    pub fn new(tables: TableStore, consensus: C) -> Self {
        Self {
            executor: Executor::new(tables),
            consensus,
        }
    }

    /// Runs one query string.
    pub async fn query(&self, sql: &str) -> Result<Reply, SqlError> {
        if sql.trim_matches(|c: char| c.is_whitespace() || c == ';').is_empty() {
            return Ok(Reply::Empty);
        }
        match statement::parse(sql)? {
            Statement::Select(select) => Ok(Reply::Rows(self.executor.select(&select)?)),
            Statement::Unsupported(kind) => Err(SqlError::UnsupportedStatement(kind)),
            mutation => {
                mutation.check_shape()?;
                let outcome = self.consensus.propose(Command::new(sql)).await?;
                Ok(Reply::Complete(outcome.command_tag()))
            }
        }
    }

    /// Runs one query and encodes everything that answers it, short of the
    /// trailing `ReadyForQuery`.
    pub async fn respond(&self, sql: &str) -> Vec<BackendMessage> {
        match self.query(sql).await {
            Ok(Reply::Empty) => vec![BackendMessage::EmptyQueryResponse],
            Ok(Reply::Complete(tag)) => vec![BackendMessage::CommandComplete(tag)],
            Ok(Reply::Rows(result)) => encode_rows(result),
            Err(err) => {
                match &err {
                    SqlError::ReplicaApplyFailure(_) => error!(sql, error = %err, "query failed"),
                    _ => warn!(sql, error = %err, "query failed"),
                }
                vec![error_response(&err)]
            }
        }
    }
}

fn encode_rows(result: ResultSet) -> Vec<BackendMessage> {
    let tag = format!("SELECT {}", result.rows.len());
    let fields = result
        .field_names
        .into_iter()
        .zip(&result.field_types)
        .map(|(name, type_name)| FieldDescription {
            name,
            type_oid: type_oid(type_name),
        })
        .collect();

    let mut messages = Vec::with_capacity(result.rows.len() + 2);
    messages.push(BackendMessage::RowDescription(fields));
    for row in result.rows {
        let values = row.iter().map(|value| Some(value.to_string())).collect();
        messages.push(BackendMessage::DataRow(values));
    }
    messages.push(BackendMessage::CommandComplete(tag));
    messages
}

fn error_response(err: &SqlError) -> BackendMessage {
    BackendMessage::ErrorResponse {
        code: err.sqlstate().to_string(),
        message: err.to_string(),
    }
}

/// Accepts client connections until the listener fails.
pub async fn serve<C: Consensus>(listener: TcpListener, frontend: Arc<Frontend<C>>) -> Result<()> {
    loop {
        let (socket, peer) = listener
            .accept()
            .await
            .context("failed to accept pg connection")?;
        let frontend = frontend.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, peer, frontend).await {
                debug!(%peer, error = ?err, "pg connection closed");
            }
        });
    }
}

async fn handle_conn<C: Consensus>(
    socket: TcpStream,
    peer: SocketAddr,
    frontend: Arc<Frontend<C>>,
) -> Result<()> {
    let mut framed = Framed::new(socket, PgCodec::new());

    loop {
        let Some(message) = framed.next().await else {
            return Ok(());
        };
        match message? {
            FrontendMessage::SslRequest | FrontendMessage::GssEncRequest => {
                framed.send(BackendMessage::EncryptionDenied).await?;
            }
            FrontendMessage::CancelRequest => return Ok(()),
            FrontendMessage::Startup { params } => {
                info!(%peer, user = params.get("user").map(String::as_str), "session started");
                framed.feed(BackendMessage::AuthenticationOk).await?;
                for (name, value) in SERVER_PARAMETERS {
                    framed
                        .feed(BackendMessage::ParameterStatus {
                            name: name.to_string(),
                            value: value.to_string(),
                        })
                        .await?;
                }
                framed.send(BackendMessage::ReadyForQuery).await?;
                break;
            }
            other => anyhow::bail!("unexpected {other:?} before startup"),
        }
    }

    while let Some(message) = framed.next().await {
        match message? {
            FrontendMessage::Query(sql) => {
                debug!(%peer, sql, "query");
                for reply in frontend.respond(&sql).await {
                    framed.feed(reply).await?;
                }
                framed.send(BackendMessage::ReadyForQuery).await?;
            }
            FrontendMessage::Terminate => break,
            other => {
                let err = SqlError::UnsupportedStatement(format!("protocol message {other:?}"));
                framed.send(error_response(&err)).await?;
                break;
            }
        }
    }
    debug!(%peer, "session ended");
    Ok(())
}
