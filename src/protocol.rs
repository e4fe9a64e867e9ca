//! # Relay Protocol
//!
//! Defines the vocabulary shared by every component of the relay:
//! - **Roles**: the service an agent or viewer connection performs
//! - **Control packets**: the fixed byte sequences sent in-band on the
//!   binary channels (pause/unpause toward agents, disconnect toward
//!   viewers)
//! - **Structured messages**: text frames carrying a JSON object with a
//!   `"type"` field. Known types (`chat_message`, `status_update`) are
//!   classified and broadcast; everything else is opaque to the relay and
//!   flows through unmodified.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

// ─── Control Packets ────────────────────────────────────────────

/// Sent to a screen agent when its last viewer disconnects.
pub const PAUSE_PACKET: [u8; 6] = [0x00, 0x4A, 0x00, 0x06, 0x00, 0x01];

/// Sent to a screen agent when its viewer list becomes non-empty.
pub const UNPAUSE_PACKET: [u8; 6] = [0x00, 0x49, 0x00, 0x06, 0x00, 0x01];

/// Single-byte notice pushed to every viewer of a slot when its agent
/// goes away.
pub const AGENT_DISCONNECTED_PACKET: [u8; 1] = [0x63];

// ─── Roles ──────────────────────────────────────────────────────

/// The service a connection performs, encoded in the WebSocket path.
///
/// `CAgent` produces screen/video frames, `FileAgent` serves filesystem
/// operations, and `ChatAgent` is the presence-bearing conversational
/// role. `CAgent` and `FileAgent` are aliased for fallback: a request
/// addressed to one is served by the other at the same (tenant, key)
/// when the addressed role is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    CAgent,
    FileAgent,
    ChatAgent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::CAgent => "c_agent",
            Role::FileAgent => "file_agent",
            Role::ChatAgent => "chat_agent",
        }
    }

    /// The role that may answer on this role's behalf, if any.
    pub fn fallback(self) -> Option<Role> {
        match self {
            Role::CAgent => Some(Role::FileAgent),
            Role::FileAgent => Some(Role::CAgent),
            Role::ChatAgent => None,
        }
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, UnknownRole> {
        match s {
            "c_agent" => Ok(Role::CAgent),
            "file_agent" => Ok(Role::FileAgent),
            "chat_agent" => Ok(Role::ChatAgent),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A role string outside the accepted set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

// ─── Structured Messages ────────────────────────────────────────

/// Presence state carried by `status_update` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

/// The `status_update` broadcast shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub agent_id: String,
    pub status: AgentStatus,
    pub agent_type: String,
}

impl StatusUpdate {
    pub fn new(tenant_id: &str, role: Role, status: AgentStatus) -> Self {
        Self {
            msg_type: "status_update".to_string(),
            agent_id: tenant_id.to_string(),
            status,
            agent_type: role.as_str().to_string(),
        }
    }
}

/// Classification of a structured message read from a viewer socket.
///
/// `Chat` and `Status` are consumed by the broadcast bus and never reach
/// the agent; `Other` is a bridge payload or agent-bound command whose
/// `type` is opaque to the relay.
#[derive(Debug)]
pub enum ViewerMessage {
    Chat(Map<String, Value>),
    Status(Map<String, Value>),
    Other(Map<String, Value>),
}

impl ViewerMessage {
    pub fn classify(message: Map<String, Value>) -> Self {
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        match kind.as_deref() {
            Some("chat_message") => ViewerMessage::Chat(message),
            Some("status_update") => ViewerMessage::Status(message),
            _ => ViewerMessage::Other(message),
        }
    }
}

// ─── Text Frame Helpers ─────────────────────────────────────────

/// Strips NUL bytes and surrounding whitespace from an inbound text
/// frame. Returns `None` when nothing remains.
pub fn sanitize(text: &str) -> Option<String> {
    let cleaned = text.replace('\0', "");
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses a sanitized text frame into a JSON object. Non-object JSON
/// (numbers, strings, arrays) is not a structured relay message.
pub fn parse_structured(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Whether a payload is valid JSON. Decides text vs. binary framing on
/// the agent-bound socket.
pub fn is_structured(payload: &[u8]) -> bool {
    serde_json::from_slice::<Value>(payload).is_ok()
}

/// Renders a `request_id` field, which agents may send as either a JSON
/// string or a number.
pub fn request_id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
