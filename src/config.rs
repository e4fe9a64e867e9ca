//! Environment-driven server configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listening port. TLS termination happens in front of the relay.
    pub port: u16,
    /// Path of the JSON key store file.
    pub store_path: PathBuf,
    /// Per-viewer frame buffer capacity.
    pub frame_buffer_capacity: usize,
    /// Agent uplink channel capacity.
    pub uplink_capacity: usize,
    /// How long the HTTP bridge waits to enqueue onto a full uplink.
    pub send_deadline: Duration,
    /// How long the HTTP bridge waits for the agent's response.
    pub receive_deadline: Duration,
    /// Frame buffers idle longer than this are swept.
    pub buffer_max_idle: Duration,
    /// Interval of the stale-buffer sweep task.
    pub buffer_sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            store_path: env::var("RELAY_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| defaults.store_path.clone()),
            frame_buffer_capacity: env::var("RELAY_FRAME_BUFFER_CAPACITY")
                .ok()
                .and_then(|c| c.parse().ok())
                .unwrap_or(defaults.frame_buffer_capacity),
            ..defaults
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 443,
            store_path: PathBuf::from("data.json"),
            frame_buffer_capacity: 30,
            uplink_capacity: 50,
            send_deadline: Duration::from_secs(5),
            receive_deadline: Duration::from_secs(30),
            buffer_max_idle: Duration::from_secs(300),
            buffer_sweep_interval: Duration::from_secs(60),
        }
    }
}
