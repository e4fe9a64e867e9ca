//! # HTTP-to-Agent Bridge
//!
//! Converts an HTTP request into an agent-bound message stamped with a
//! fresh `request_id`, then waits for the agent's correlated reply. The
//! agent session's reader delivers the reply through a single-shot slot
//! registered here. Both directions are bounded: enqueueing onto a full
//! uplink gives up after the send deadline, and an unanswered call gives
//! up after the receive deadline. Every exit path removes the pending
//! entry, so the correlation map only ever holds in-flight calls.

use crate::error::BridgeError;
use crate::protocol::Role;
use crate::state::AppState;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// In-flight bridge calls, keyed by request ID. Each entry has exactly
/// one producer (the agent reader) and one consumer (the bridge call).
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: DashMap<String, oneshot::Sender<Value>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a single-shot response slot and returns its receiving
    /// half.
    pub fn insert(&self, request_id: String) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(request_id, tx);
        rx
    }

    /// Delivers an agent response to the waiting caller, removing the
    /// entry. Returns false when no caller was waiting under that ID.
    pub fn complete(&self, request_id: &str, response: Value) -> bool {
        let Some((_, tx)) = self.inner.remove(request_id) else {
            return false;
        };
        if tx.send(response).is_err() {
            // The caller gave up (deadline) between removal and delivery.
            warn!("response slot for request {} was already closed", request_id);
        }
        true
    }

    /// Discards a pending entry after a timed-out call.
    pub fn cancel(&self, request_id: &str) {
        self.inner.remove(request_id);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Sends a structured message to the agent serving `(tenant, role, key)`
/// and waits for its reply.
///
/// The key arrives as the viewer-visible public key and is resolved to
/// its private counterpart first; when the store has no mapping yet the
/// raw value is used as-is. The addressed role falls back to its alias
/// when absent.
pub async fn call(
    state: &AppState,
    tenant_id: &str,
    role: Role,
    key: &str,
    mut payload: Value,
) -> Result<Value, BridgeError> {
    let private_key = state
        .keystore
        .get_private_by_public(key)
        .unwrap_or_else(|| key.to_string());

    let Some((served_by, uplink)) = state
        .registry
        .resolve_uplink(tenant_id, role, &private_key)
        .await
    else {
        let available = state.registry.uplink_keys(tenant_id, role).await;
        debug!(
            "no uplink for {}/{}/{} (available: {:?})",
            tenant_id, role, private_key, available
        );
        return Err(BridgeError::NoAgent {
            role: role.to_string(),
            key: key.to_string(),
            private: private_key,
        });
    };
    if served_by != role {
        debug!(
            "request for {} served by {} at tenant {} key {}",
            role, served_by, tenant_id, private_key
        );
    }

    let request_id = Uuid::new_v4().to_string();
    if let Some(message) = payload.as_object_mut() {
        message.insert("request_id".to_string(), Value::String(request_id.clone()));
    }
    let data = serde_json::to_vec(&payload)?;

    let response = state.pending.insert(request_id.clone());

    if let Err(err) = uplink
        .send_timeout(data, state.config.send_deadline)
        .await
    {
        state.pending.cancel(&request_id);
        debug!("timed out sending request {} to agent: {}", request_id, err);
        return Err(BridgeError::SendTimeout);
    }

    match tokio::time::timeout(state.config.receive_deadline, response).await {
        Ok(Ok(message)) => {
            debug!("request {} answered", request_id);
            Ok(message)
        }
        // The sender half vanished without a reply; treat it like an
        // unanswered call.
        Ok(Err(_)) | Err(_) => {
            state.pending.cancel(&request_id);
            debug!("timed out waiting for response to request {}", request_id);
            Err(BridgeError::ReceiveTimeout)
        }
    }
}
