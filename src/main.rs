use relay_server::config::Config;
use relay_server::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() {
    // DEBUG_LOG=1 turns on verbose diagnostics; RUST_LOG still wins.
    let debug_log = std::env::var("DEBUG_LOG").map(|v| v == "1").unwrap_or(false);
    let default_filter = if debug_log {
        "relay_server=debug,tower_http=debug"
    } else {
        "relay_server=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config = Config::from_env();
    let state = Arc::new(AppState::new(config.clone()));
    state.start_maintenance();

    let app = relay_server::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("relay server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
