//! # WebSocket Endpoint
//!
//! `GET /ws/{direction}/{role}/{tenant_id}/{key}`: the single upgrade
//! point for both sides of the relay. `rev` opens an agent session (the
//! connection is the uplink's far end), `cli` opens a viewer session.
//! Plain GETs without an upgrade are refused by the extractor with
//! 426 Upgrade Required.

use crate::agent::run_agent_session;
use crate::protocol::Role;
use crate::state::SharedState;
use crate::viewer::run_viewer_session;
use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use tracing::{debug, warn};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((direction, role, tenant_id, key)): Path<(String, String, String, String)>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<SharedState>,
) -> Response {
    // Single audit line per connection attempt.
    debug!(
        "ws connect from {}: direction={}, role={}, tenant={}, key={}",
        remote, direction, role, tenant_id, key
    );

    let role = match role.parse::<Role>() {
        Ok(role) => role,
        Err(unknown) => {
            warn!("rejecting connection with unknown role {}", unknown.0);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match direction.as_str() {
        "rev" => ws
            .on_upgrade(move |socket| run_agent_session(state, socket, tenant_id, role, key)),
        "cli" => ws
            .on_upgrade(move |socket| run_viewer_session(state, socket, tenant_id, role, key)),
        other => {
            warn!("rejecting connection with unknown direction {}", other);
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}
