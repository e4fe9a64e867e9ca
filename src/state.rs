//! Shared application state, cloned into every handler.

use crate::bridge::PendingRequests;
use crate::config::Config;
use crate::frame_buffer::ViewerFrameBuffers;
use crate::keystore::KeyStore;
use crate::registry::Registry;
use std::sync::Arc;
use tracing::debug;

pub struct AppState {
    pub config: Config,
    pub registry: Registry,
    pub pending: PendingRequests,
    pub keystore: KeyStore,
    pub frame_buffers: ViewerFrameBuffers,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: Config) -> Self {
        let keystore = KeyStore::new(config.store_path.clone());
        Self {
            config,
            registry: Registry::new(),
            pending: PendingRequests::new(),
            keystore,
            frame_buffers: ViewerFrameBuffers::new(),
        }
    }

    /// Spawns the periodic sweep that discards frame buffers whose
    /// producers have gone quiet.
    pub fn start_maintenance(self: &Arc<Self>) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.config.buffer_sweep_interval);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = state
                    .frame_buffers
                    .cleanup_stale(state.config.buffer_max_idle);
                if removed > 0 {
                    debug!("swept {} stale frame buffers", removed);
                }
            }
        });
    }
}
