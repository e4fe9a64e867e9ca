//! Multi-tenant WebSocket relay between long-lived remote agents and
//! short-lived browser viewers.
//!
//! Agents connect "in reverse" (`/ws/rev/…`) and register an uplink per
//! `(tenant, role, key)` slot; viewers connect forward (`/ws/cli/…`) and
//! receive the agent's binary stream while their own traffic is piped
//! back up. An HTTP surface under `/api/v1` bridges request/response
//! calls onto the same uplinks with correlation IDs and deadlines.

pub mod agent;
pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod frame_buffer;
pub mod keystore;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod video;
pub mod viewer;
pub mod ws;

use axum::routing::get;
use axum::Router;
use state::SharedState;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Builds the complete relay router: the WebSocket endpoint plus the
/// bridged HTTP surface.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/ws/{direction}/{agent_type}/{tenant_id}/{key}",
            get(ws::ws_handler),
        )
        .nest("/api/v1", api::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
