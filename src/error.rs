//! Error types surfaced by the HTTP bridge and the key store.
//!
//! Session I/O failures are handled locally inside the session tasks and
//! never become typed errors; only the bridge needs to report failure to
//! an HTTP caller, and only the store can fail persistently.

use thiserror::Error;

/// Failure of a bridged HTTP-to-agent call. Display texts are the wire
/// contract: they are returned verbatim in the `{"error": …}` envelope.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No uplink for the slot, even after role fallback. The role is
    /// kept as the caller's raw string: a role outside the accepted set
    /// is reported exactly like any other absent agent.
    #[error("no {role} found for key: {key} (private: {private})")]
    NoAgent {
        role: String,
        key: String,
        private: String,
    },

    /// The uplink channel stayed full past the send deadline.
    #[error("timeout sending message to agent")]
    SendTimeout,

    /// The agent never answered within the receive deadline.
    #[error("timeout waiting for agent response")]
    ReceiveTimeout,

    #[error("failed to marshal message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Key store persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key store parse error: {0}")]
    Json(#[from] serde_json::Error),
}
