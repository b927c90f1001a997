//! Admin HTTP server: cluster membership and node status.
//!
//! - `POST /add_follower` with `{"id": 2, "addr": "127.0.0.1:7102"}` adds a voter
//! - `GET /status` reports this node's raft view

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::SqlError;
use crate::runtime::{NodeStatus, RaftHandle};

#[derive(Debug, Deserialize)]
pub struct AddFollowerRequest {
    pub id: u64,
    /// Raft address of the new member.
    pub addr: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub node_id: u64,
    pub role: String,
    pub leader_id: u64,
    pub term: u64,
    pub applied_index: u64,
    pub peers: BTreeMap<u64, String>,
}

impl From<NodeStatus> for StatusResponse {
    fn from(status: NodeStatus) -> Self {
        Self {
            node_id: status.node_id,
            role: format!("{:?}", status.role),
            leader_id: status.leader_id,
            term: status.term,
            applied_index: status.applied_index,
            peers: status.peers,
        }
    }
}

pub fn router(raft: RaftHandle) -> Router {
    Router::new()
        .route("/add_follower", post(add_follower))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(raft)
}

/// Serves the admin router until the listener fails.
pub async fn serve(listener: TcpListener, raft: RaftHandle) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "admin server listening");
    axum::serve(listener, router(raft))
        .await
        .context("admin server failed")
}

async fn add_follower(
    State(raft): State<RaftHandle>,
    Json(request): Json<AddFollowerRequest>,
) -> impl IntoResponse {
    match raft.add_member(request.id, request.addr.clone()).await {
        Ok(()) => {
            info!(member = request.id, addr = %request.addr, "follower added");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "id": request.id, "addr": request.addr })),
            )
        }
        Err(err) => {
            let status = if err.is_retryable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(error_body(&err)))
        }
    }
}

async fn status(State(raft): State<RaftHandle>) -> impl IntoResponse {
    match raft.status().await {
        Ok(status) => (
            StatusCode::OK,
            Json(serde_json::to_value(StatusResponse::from(status)).unwrap_or_default()),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": format!("{err:#}") })),
        ),
    }
}

fn error_body(err: &SqlError) -> serde_json::Value {
    serde_json::json!({ "error": err.to_string(), "code": err.sqlstate() })
}
