//! # Presence Broadcast Bus
//!
//! Chat messages and status updates fan out to every chat viewer of the
//! owning tenant, across all keys. Sends are non-blocking: a viewer whose
//! writer has gone away simply misses the broadcast; its own cleanup path
//! removes it from the registry.

use crate::protocol::{AgentStatus, Role, StatusUpdate};
use crate::registry::{Registry, ViewerEvent};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Publishes a chat payload to every chat viewer of the tenant.
pub async fn publish_chat(registry: &Registry, tenant_id: &str, message: Value) {
    broadcast_to_chat_viewers(registry, tenant_id, message).await;
}

/// Publishes a status payload to every chat viewer of the tenant.
pub async fn publish_status(registry: &Registry, tenant_id: &str, message: Value) {
    broadcast_to_chat_viewers(registry, tenant_id, message).await;
}

async fn broadcast_to_chat_viewers(registry: &Registry, tenant_id: &str, message: Value) {
    let text = message.to_string();
    let sinks = registry.role_sinks(tenant_id, Role::ChatAgent).await;
    debug!(
        "broadcasting to {} chat viewers of tenant {}",
        sinks.len(),
        tenant_id
    );
    for sink in sinks {
        let _ = sink.tx.send(ViewerEvent::Text(text.clone()));
    }
}

/// Announces an agent's presence transition to its tenant's chat viewers.
pub async fn broadcast_agent_status(registry: &Registry, tenant_id: &str, status: AgentStatus) {
    let update = StatusUpdate::new(tenant_id, Role::ChatAgent, status);
    match serde_json::to_value(&update) {
        Ok(message) => publish_status(registry, tenant_id, message).await,
        Err(err) => warn!("could not serialize status update: {}", err),
    }
}

/// Sends the current presence of every registered chat uplink of the
/// tenant to one newly connected viewer. Registration is the relay's
/// only liveness signal, so every known uplink reports online.
pub async fn send_current_statuses(
    registry: &Registry,
    viewer: &mpsc::UnboundedSender<ViewerEvent>,
    tenant_id: &str,
) {
    for key in registry.uplink_keys(tenant_id, Role::ChatAgent).await {
        let update = StatusUpdate::new(tenant_id, Role::ChatAgent, AgentStatus::Online);
        match serde_json::to_string(&update) {
            Ok(text) => {
                debug!(
                    "sending online status for chat agent {}/{} to new viewer",
                    tenant_id, key
                );
                let _ = viewer.send(ViewerEvent::Text(text));
            }
            Err(err) => warn!("could not serialize status update: {}", err),
        }
    }
}
