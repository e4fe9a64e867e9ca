//! # Viewer Session (forward client)
//!
//! One session per connected viewer. The viewer addresses its slot by
//! the agent's public key; the key store resolves it to the private key
//! the registry is slotted under (falling back to the raw value when the
//! store has no mapping yet; the agent may register later, and every
//! dispatch resolves live registry state).
//!
//! A writer task drains the viewer's outbound queue onto the socket; for
//! the video role, frames travel through the per-viewer frame buffer so
//! a slow socket sheds load by the keyframe rules instead of stalling
//! the agent's distributor. The read loop annotates structured messages
//! and forwards raw bytes to the agent uplink.

use crate::frame_buffer::FrameBuffer;
use crate::presence;
use crate::protocol::{self, Role, ViewerMessage};
use crate::registry::ViewerEvent;
use crate::state::SharedState;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub async fn run_viewer_session(
    state: SharedState,
    socket: WebSocket,
    tenant_id: String,
    role: Role,
    raw_key: String,
) {
    let key = match state.keystore.get_private_by_public(&raw_key) {
        Some(private) => private,
        None => {
            debug!(
                "no key mapping yet for {}, using the raw value",
                raw_key
            );
            raw_key
        }
    };

    // Video viewers get a frame buffer; everything else is queue-only.
    let buffer_id = (role == Role::CAgent).then(|| Uuid::new_v4().to_string());
    let buffer = buffer_id.as_deref().map(|id| {
        state
            .frame_buffers
            .get_or_create(id, state.config.frame_buffer_capacity)
    });

    let (tx, rx) = mpsc::unbounded_channel::<ViewerEvent>();
    let (ordinal, edge) = state
        .registry
        .register_viewer(&tenant_id, role, &key, tx.clone(), buffer.clone())
        .await;
    if let Some(edge) = edge {
        edge.emit();
    }
    if role == Role::ChatAgent {
        presence::send_current_statuses(&state.registry, &tx, &tenant_id).await;
    }

    let (ws_sink, mut ws_stream) = socket.split();
    tokio::spawn(write_to_viewer(
        state.clone(),
        ws_sink,
        rx,
        tenant_id.clone(),
        role,
        key.clone(),
        ordinal,
        buffer.clone(),
        buffer_id.clone(),
    ));

    // ── Read Loop ──
    while let Some(result) = ws_stream.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                debug!("viewer read error: {}", err);
                break;
            }
        };
        match message {
            Message::Text(text) => {
                if handle_viewer_text(&state, &tenant_id, role, &key, text.as_str()).await {
                    continue;
                }
                forward_to_uplink(
                    &state,
                    &tenant_id,
                    role,
                    &key,
                    text.as_str().as_bytes().to_vec(),
                )
                .await;
            }
            Message::Binary(data) => {
                forward_to_uplink(&state, &tenant_id, role, &key, data.to_vec()).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    deregister(&state, &tenant_id, role, &key, ordinal, buffer_id.as_deref()).await;
}

/// Handles a structured text frame. Returns true when the message was
/// consumed by the broadcast bus and must not reach the uplink.
async fn handle_viewer_text(
    state: &SharedState,
    tenant_id: &str,
    role: Role,
    key: &str,
    text: &str,
) -> bool {
    let Some(cleaned) = protocol::sanitize(text) else {
        return false;
    };
    let Some(mut message) = protocol::parse_structured(&cleaned) else {
        return false;
    };

    message.insert(
        "tenant_id".to_string(),
        Value::String(tenant_id.to_string()),
    );
    if !message.contains_key("from") {
        message.insert("from".to_string(), Value::String(key.to_string()));
    }
    message.insert(
        "agent_type".to_string(),
        Value::String(role.as_str().to_string()),
    );

    match ViewerMessage::classify(message) {
        ViewerMessage::Chat(mut message) => {
            message.insert(
                "source".to_string(),
                Value::String("javascript_client".to_string()),
            );
            presence::publish_chat(&state.registry, tenant_id, Value::Object(message)).await;
            true
        }
        ViewerMessage::Status(message) => {
            presence::publish_status(&state.registry, tenant_id, Value::Object(message)).await;
            true
        }
        // Agent-bound command: the caller forwards the original bytes.
        ViewerMessage::Other(_) => false,
    }
}

/// Hands raw bytes to the slot's uplink, if one is registered.
/// Non-blocking: a full channel drops the message with a warning.
async fn forward_to_uplink(
    state: &SharedState,
    tenant_id: &str,
    role: Role,
    key: &str,
    payload: Vec<u8>,
) {
    match state.registry.uplink_for(tenant_id, role, key).await {
        Some(uplink) => {
            if let Err(err) = uplink.try_send(payload) {
                warn!(
                    "uplink channel blocked for {}/{}/{}: {}",
                    tenant_id, role, key, err
                );
            }
        }
        None => {
            let known = state.registry.uplink_keys(tenant_id, role).await;
            debug!(
                "no agent uplink for {}/{}/{}, known keys: {:?}",
                tenant_id, role, key, known
            );
        }
    }
}

/// Drains the viewer's outbound queue onto its socket. A write failure
/// deregisters the viewer from this side; the read loop's own exit path
/// replays the same removal as a no-op.
#[allow(clippy::too_many_arguments)]
async fn write_to_viewer(
    state: SharedState,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ViewerEvent>,
    tenant_id: String,
    role: Role,
    key: String,
    ordinal: u64,
    buffer: Option<Arc<FrameBuffer>>,
    buffer_id: Option<String>,
) {
    while let Some(event) = rx.recv().await {
        let result = match event {
            ViewerEvent::Text(text) => sink.send(Message::Text(text.into())).await,
            ViewerEvent::Binary(payload) => sink.send(Message::Binary(payload.into())).await,
            ViewerEvent::FrameReady => {
                let mut result = Ok(());
                if let Some(buffer) = &buffer {
                    for frame in buffer.pop_all() {
                        result = sink.send(Message::Binary(frame.data.into())).await;
                        if result.is_err() {
                            break;
                        }
                    }
                }
                result
            }
        };
        if let Err(err) = result {
            debug!("viewer write error: {}", err);
            deregister(&state, &tenant_id, role, &key, ordinal, buffer_id.as_deref()).await;
            return;
        }
    }
}

/// Removes the viewer's registry entry and frame buffer. Safe to call
/// from both the reader and the writer; removal is matched by ordinal,
/// so the second call finds nothing.
async fn deregister(
    state: &SharedState,
    tenant_id: &str,
    role: Role,
    key: &str,
    ordinal: u64,
    buffer_id: Option<&str>,
) {
    if let Some(edge) = state
        .registry
        .unregister_viewer(tenant_id, role, key, ordinal)
        .await
    {
        edge.emit();
    }
    if let Some(id) = buffer_id {
        state.frame_buffers.remove(id);
    }
}
