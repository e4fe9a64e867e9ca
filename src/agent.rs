//! # Agent Session (reverse client)
//!
//! One session per connected agent. Three cooperating tasks share it:
//!
//! 1. **Reader** (agent → relay): demultiplexes inbound traffic. Text
//!    frames are either a response to a pending bridge call, a chat
//!    message to broadcast, or dropped; binary frames are queued for the
//!    distributor.
//! 2. **Writer** (relay → agent): drains the uplink channel, framing
//!    each payload as text when it is valid JSON and binary otherwise.
//! 3. **Distributor**: fans queued binary payloads out to the slot's
//!    viewers, through their frame buffers for the video role. A failed
//!    viewer is removed without disturbing the rest.
//!
//! Reader and writer must not block each other (the socket is
//! full-duplex), and the distributor isolates slow-viewer fan-out from
//! the inbound pipe so one stalled viewer cannot stall the agent. Any
//! task exiting funnels into an idempotent `cleanup` that unregisters
//! the uplink, notifies viewers with the in-band disconnect byte, and
//! publishes the structured disconnect event.

use crate::presence;
use crate::protocol::{self, AgentStatus, Role, AGENT_DISCONNECTED_PACKET};
use crate::registry::ViewerEvent;
use crate::state::SharedState;
use crate::video;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Queue between the reader and the distributor.
const DISTRIBUTOR_QUEUE: usize = 100;

#[derive(Clone)]
struct AgentSession {
    state: SharedState,
    tenant_id: String,
    role: Role,
    key: String,
    /// Weak handle to the registered uplink. Holding it weakly lets the
    /// channel close the moment the registry slot is dropped, which is
    /// how the writer learns its session is over.
    uplink: mpsc::WeakSender<Vec<u8>>,
    running: Arc<AtomicBool>,
}

pub async fn run_agent_session(
    state: SharedState,
    socket: WebSocket,
    tenant_id: String,
    role: Role,
    key: String,
) {
    // Reuse the tenant's public key if one exists, mint one otherwise,
    // and persist the pair. The store keeps an existing public key
    // stable across re-registrations.
    let publickey = state
        .keystore
        .get_public_by_name(&tenant_id)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    if let Err(err) = state.keystore.upsert_agent(&tenant_id, &key, &publickey) {
        warn!("could not persist key chain for tenant {}: {}", tenant_id, err);
    }

    let (uplink_tx, uplink_rx) = mpsc::channel::<Vec<u8>>(state.config.uplink_capacity);
    state
        .registry
        .register_uplink(&tenant_id, role, &key, uplink_tx.clone())
        .await;
    if role == Role::ChatAgent {
        presence::broadcast_agent_status(&state.registry, &tenant_id, AgentStatus::Online).await;
    }

    let session = AgentSession {
        state,
        tenant_id,
        role,
        key,
        uplink: uplink_tx.downgrade(),
        running: Arc::new(AtomicBool::new(true)),
    };
    // The registry clone is now the only strong sender we keep alive.
    drop(uplink_tx);

    let (ws_sink, ws_stream) = socket.split();
    let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(DISTRIBUTOR_QUEUE);

    tokio::spawn(write_to_agent(session.clone(), ws_sink, uplink_rx));
    tokio::spawn(distribute_to_viewers(session.clone(), frame_rx));

    let reason = read_from_agent(&session, ws_stream, frame_tx).await;
    session.cleanup(reason).await;
}

// ─── Reader ─────────────────────────────────────────────────────

async fn read_from_agent(
    session: &AgentSession,
    mut stream: SplitStream<WebSocket>,
    frames: mpsc::Sender<Vec<u8>>,
) -> &'static str {
    while session.is_running() {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!("agent read error: {}", err);
                return "read error";
            }
            None => return "socket closed",
        };
        match message {
            Message::Text(text) => session.handle_text(text.as_str()).await,
            Message::Binary(data) => {
                // Applies the distributor queue's backpressure to the
                // agent socket rather than dropping frames here.
                if frames.send(data.to_vec()).await.is_err() {
                    return "socket closed";
                }
            }
            Message::Close(_) => return "socket closed",
            _ => {}
        }
    }
    "socket closed"
}

// ─── Writer ─────────────────────────────────────────────────────

/// Drains the uplink channel onto the agent socket. Ends when the
/// channel closes (slot unregistered or replaced) or a write fails.
async fn write_to_agent(
    session: AgentSession,
    mut sink: SplitSink<WebSocket, Message>,
    mut uplink_rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(payload) = uplink_rx.recv().await {
        if !session.is_running() {
            break;
        }
        let message = if protocol::is_structured(&payload) {
            match String::from_utf8(payload) {
                Ok(text) => Message::Text(text.into()),
                Err(err) => Message::Binary(err.into_bytes().into()),
            }
        } else {
            Message::Binary(payload.into())
        };
        if let Err(err) = sink.send(message).await {
            debug!("agent write error: {}", err);
            session.cleanup("write error").await;
            return;
        }
    }
    session.cleanup("channel closed").await;
}

// ─── Distributor ────────────────────────────────────────────────

/// Fans each queued payload out to the slot's current viewers. The
/// viewer list is re-read per payload, so viewers joining mid-stream
/// start receiving immediately.
async fn distribute_to_viewers(session: AgentSession, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = frames.recv().await {
        if !session.is_running() {
            break;
        }
        let sinks = session
            .state
            .registry
            .viewer_sinks(&session.tenant_id, session.role, &session.key)
            .await;
        for sink in sinks {
            let delivered = match &sink.frames {
                Some(buffer) => {
                    buffer.push(payload.clone(), video::classify_keyframe(&payload));
                    sink.tx.send(ViewerEvent::FrameReady).is_ok()
                }
                None => sink.tx.send(ViewerEvent::Binary(payload.clone())).is_ok(),
            };
            if !delivered {
                debug!("write error (removing viewer {})", sink.ordinal);
                session.broadcast_disconnect("write error").await;
                let removed = session
                    .state
                    .registry
                    .unregister_viewer(
                        &session.tenant_id,
                        session.role,
                        &session.key,
                        sink.ordinal,
                    )
                    .await;
                if let Some(edge) = removed {
                    edge.emit();
                }
            }
        }
    }
}

// ─── Session Plumbing ───────────────────────────────────────────

impl AgentSession {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn handle_text(&self, text: &str) {
        let Some(cleaned) = protocol::sanitize(text) else {
            return;
        };
        let Some(mut message) = protocol::parse_structured(&cleaned) else {
            return;
        };

        // A response to an in-flight bridge call wins over everything
        // else; an unmatched request_id falls through to type dispatch.
        if let Some(request_id) = message.get("request_id").map(protocol::request_id_string) {
            if self
                .state
                .pending
                .complete(&request_id, Value::Object(message.clone()))
            {
                debug!("delivered agent response for request {}", request_id);
                return;
            }
        }

        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        if kind.as_deref() == Some("chat_message") {
            message.insert(
                "source".to_string(),
                Value::String("chat_agent".to_string()),
            );
            message.insert("from".to_string(), Value::String(self.tenant_id.clone()));
            presence::publish_chat(
                &self.state.registry,
                &self.tenant_id,
                Value::Object(message),
            )
            .await;
        }
        // Unrecognized structured text is dropped; binary frames are the
        // only passthrough toward viewers.
    }

    /// Notifies every party interested in this agent going away: the
    /// tenant's chat viewers get the structured event, the slot's own
    /// viewers get the in-band disconnect byte.
    async fn broadcast_disconnect(&self, reason: &str) {
        let message = json!({
            "type": "agent_disconnected",
            "tenant_id": self.tenant_id,
            "agentType": self.role.as_str(),
            "key": self.key,
            "reason": reason,
        });
        presence::publish_chat(&self.state.registry, &self.tenant_id, message).await;

        let sinks = self
            .state
            .registry
            .viewer_sinks(&self.tenant_id, self.role, &self.key)
            .await;
        for sink in sinks {
            let _ = sink
                .tx
                .send(ViewerEvent::Binary(AGENT_DISCONNECTED_PACKET.to_vec()));
        }
    }

    /// Tears the session down exactly once. Whichever task gets here
    /// first removes the uplink slot (closing the channel the writer
    /// drains); later callers find the slot gone and do nothing, so the
    /// disconnect is only ever announced once.
    async fn cleanup(&self, reason: &str) {
        self.running.store(false, Ordering::SeqCst);
        let Some(own) = self.uplink.upgrade() else {
            return;
        };
        let removed = self
            .state
            .registry
            .unregister_uplink(&self.tenant_id, self.role, &self.key, &own)
            .await;
        drop(own);
        if !removed {
            return;
        }
        debug!(
            "cleaning up agent session {}/{}/{} ({})",
            self.tenant_id, self.role, self.key, reason
        );
        self.broadcast_disconnect(reason).await;
        if self.role == Role::ChatAgent {
            presence::broadcast_agent_status(
                &self.state.registry,
                &self.tenant_id,
                AgentStatus::Offline,
            )
            .await;
        }
    }
}
