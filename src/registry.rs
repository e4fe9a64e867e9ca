//! # Connection Registry
//!
//! Holds the tenant-partitioned routing state of the relay:
//! - **Viewers**: `tenant → role → key → ordered viewer sinks`
//! - **Uplinks**: `tenant → role → key → agent uplink sender`
//!
//! Each tree sits behind its own reader-writer lock. Mutating operations
//! report presence edges (pause when a viewer list empties, unpause when
//! one fills) back to the caller instead of sending them inline, so the
//! uplink channel's backpressure can never deadlock against a held
//! registry lock. Empty leaves are pruned upward on removal, keeping the
//! trees an exact reflection of the live connection set.

use crate::frame_buffer::FrameBuffer;
use crate::protocol::{Role, PAUSE_PACKET, UNPAUSE_PACKET};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Bytes queued toward one agent. The channel is bounded; every producer
/// except the HTTP bridge uses a non-blocking send.
pub type UplinkSender = mpsc::Sender<Vec<u8>>;

/// One frame queued toward a viewer socket.
#[derive(Debug)]
pub enum ViewerEvent {
    /// A structured broadcast (chat, status) delivered as a text frame.
    Text(String),
    /// Raw bytes delivered as a binary frame.
    Binary(Vec<u8>),
    /// A video frame was pushed into the viewer's frame buffer; the
    /// writer should drain it.
    FrameReady,
}

/// A registered viewer connection: its outbound queue, its stable
/// ordinal within the slot, and (for the video role) its frame buffer.
#[derive(Debug, Clone)]
pub struct ViewerSink {
    pub ordinal: u64,
    pub tx: mpsc::UnboundedSender<ViewerEvent>,
    pub frames: Option<Arc<FrameBuffer>>,
}

#[derive(Debug, Default)]
struct ViewerSlot {
    next_ordinal: u64,
    sinks: Vec<ViewerSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Pause,
    Unpause,
}

/// A pause/unpause transition captured while the registry lock was held,
/// to be emitted by the caller after it is released.
#[derive(Debug)]
pub struct PresenceEdge {
    kind: EdgeKind,
    uplink: UplinkSender,
}

impl PresenceEdge {
    pub fn kind(&self) -> EdgeKind {
        self.kind
    }

    /// Sends the control packet to the agent. Non-blocking: a full
    /// uplink drops the edge with a warning rather than stalling the
    /// registry caller.
    pub fn emit(self) {
        let packet = match self.kind {
            EdgeKind::Pause => PAUSE_PACKET.to_vec(),
            EdgeKind::Unpause => UNPAUSE_PACKET.to_vec(),
        };
        match self.uplink.try_send(packet) {
            Ok(()) => debug!("sent {:?} control packet to agent", self.kind),
            Err(err) => warn!("could not send {:?} control packet: {}", self.kind, err),
        }
    }
}

type ViewerTree = HashMap<String, HashMap<Role, HashMap<String, ViewerSlot>>>;
type UplinkTree = HashMap<String, HashMap<Role, HashMap<String, UplinkSender>>>;

#[derive(Debug, Default)]
pub struct Registry {
    viewers: RwLock<ViewerTree>,
    uplinks: RwLock<UplinkTree>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Viewer Side ─────────────────────────────────────────────

    /// Appends a viewer sink to its slot and returns the assigned
    /// ordinal. When the list goes from empty to non-empty and the slot
    /// has an uplink, the returned edge asks the agent to resume.
    pub async fn register_viewer(
        &self,
        tenant_id: &str,
        role: Role,
        key: &str,
        tx: mpsc::UnboundedSender<ViewerEvent>,
        frames: Option<Arc<FrameBuffer>>,
    ) -> (u64, Option<PresenceEdge>) {
        let (ordinal, became_populated) = {
            let mut viewers = self.viewers.write().await;
            let slot = viewers
                .entry(tenant_id.to_string())
                .or_default()
                .entry(role)
                .or_default()
                .entry(key.to_string())
                .or_default();
            let became_populated = slot.sinks.is_empty();
            let ordinal = slot.next_ordinal;
            slot.next_ordinal += 1;
            slot.sinks.push(ViewerSink {
                ordinal,
                tx,
                frames,
            });
            (ordinal, became_populated)
        };

        // Pause/unpause control packets only concern the video role.
        let edge = if became_populated && role == Role::CAgent {
            self.uplink_for(tenant_id, role, key).await.map(|uplink| {
                PresenceEdge {
                    kind: EdgeKind::Unpause,
                    uplink,
                }
            })
        } else {
            None
        };
        debug!(
            "registered viewer {}/{}/{} ordinal {}",
            tenant_id, role, key, ordinal
        );
        (ordinal, edge)
    }

    /// Removes the viewer with the given ordinal. A second removal of
    /// the same ordinal is a no-op, which makes the reader-side and
    /// writer-side deregistration race harmless. When the list empties
    /// and an uplink exists, the returned edge asks the agent to pause.
    pub async fn unregister_viewer(
        &self,
        tenant_id: &str,
        role: Role,
        key: &str,
        ordinal: u64,
    ) -> Option<PresenceEdge> {
        let emptied = {
            let mut viewers = self.viewers.write().await;
            let Some(roles) = viewers.get_mut(tenant_id) else {
                return None;
            };
            let Some(slots) = roles.get_mut(&role) else {
                return None;
            };
            let Some(slot) = slots.get_mut(key) else {
                return None;
            };
            let Some(position) = slot.sinks.iter().position(|s| s.ordinal == ordinal) else {
                return None;
            };
            slot.sinks.remove(position);
            let emptied = slot.sinks.is_empty();
            if emptied {
                slots.remove(key);
                if slots.is_empty() {
                    roles.remove(&role);
                    if roles.is_empty() {
                        viewers.remove(tenant_id);
                    }
                }
            }
            emptied
        };

        debug!(
            "unregistered viewer {}/{}/{} ordinal {}",
            tenant_id, role, key, ordinal
        );
        if emptied && role == Role::CAgent {
            self.uplink_for(tenant_id, role, key)
                .await
                .map(|uplink| PresenceEdge {
                    kind: EdgeKind::Pause,
                    uplink,
                })
        } else {
            None
        }
    }

    /// Snapshot of a slot's viewer sinks, in registration order.
    pub async fn viewer_sinks(&self, tenant_id: &str, role: Role, key: &str) -> Vec<ViewerSink> {
        let viewers = self.viewers.read().await;
        viewers
            .get(tenant_id)
            .and_then(|roles| roles.get(&role))
            .and_then(|slots| slots.get(key))
            .map(|slot| slot.sinks.clone())
            .unwrap_or_default()
    }

    /// Every viewer sink for a tenant's role, across all keys. Used by
    /// the chat/status broadcast bus.
    pub async fn role_sinks(&self, tenant_id: &str, role: Role) -> Vec<ViewerSink> {
        let viewers = self.viewers.read().await;
        viewers
            .get(tenant_id)
            .and_then(|roles| roles.get(&role))
            .map(|slots| slots.values().flat_map(|s| s.sinks.clone()).collect())
            .unwrap_or_default()
    }

    // ── Agent Side ──────────────────────────────────────────────

    /// Installs an agent uplink, replacing any existing sender for the
    /// slot. Dropping the replaced sender closes the previous agent's
    /// channel, so its writer task observes end-of-stream.
    pub async fn register_uplink(
        &self,
        tenant_id: &str,
        role: Role,
        key: &str,
        uplink: UplinkSender,
    ) {
        let mut uplinks = self.uplinks.write().await;
        let replaced = uplinks
            .entry(tenant_id.to_string())
            .or_default()
            .entry(role)
            .or_default()
            .insert(key.to_string(), uplink);
        if replaced.is_some() {
            debug!(
                "replaced existing uplink for {}/{}/{}",
                tenant_id, role, key
            );
        }
    }

    /// Removes an uplink slot, but only when it still belongs to the
    /// caller's channel. A session whose uplink has already been
    /// replaced by a reconnect must not tear down the fresh slot.
    /// Returns whether a removal happened.
    pub async fn unregister_uplink(
        &self,
        tenant_id: &str,
        role: Role,
        key: &str,
        own: &UplinkSender,
    ) -> bool {
        let mut uplinks = self.uplinks.write().await;
        let Some(roles) = uplinks.get_mut(tenant_id) else {
            return false;
        };
        let Some(slots) = roles.get_mut(&role) else {
            return false;
        };
        let Some(current) = slots.get(key) else {
            return false;
        };
        if !current.same_channel(own) {
            return false;
        }
        slots.remove(key);
        if slots.is_empty() {
            roles.remove(&role);
            if roles.is_empty() {
                uplinks.remove(tenant_id);
            }
        }
        debug!("unregistered uplink {}/{}/{}", tenant_id, role, key);
        true
    }

    /// The uplink registered for exactly this slot.
    pub async fn uplink_for(&self, tenant_id: &str, role: Role, key: &str) -> Option<UplinkSender> {
        let uplinks = self.uplinks.read().await;
        uplinks
            .get(tenant_id)
            .and_then(|roles| roles.get(&role))
            .and_then(|slots| slots.get(key))
            .cloned()
    }

    /// Resolves the uplink for a slot, falling back to the aliased role
    /// when the addressed one is absent. Returns the role that actually
    /// holds the uplink.
    pub async fn resolve_uplink(
        &self,
        tenant_id: &str,
        role: Role,
        key: &str,
    ) -> Option<(Role, UplinkSender)> {
        if let Some(uplink) = self.uplink_for(tenant_id, role, key).await {
            return Some((role, uplink));
        }
        let fallback = role.fallback()?;
        let uplink = self.uplink_for(tenant_id, fallback, key).await?;
        debug!(
            "fell back to role {} for tenant {} key {}",
            fallback, tenant_id, key
        );
        Some((fallback, uplink))
    }

    /// Keys with a registered uplink under a tenant's role.
    pub async fn uplink_keys(&self, tenant_id: &str, role: Role) -> Vec<String> {
        let uplinks = self.uplinks.read().await;
        uplinks
            .get(tenant_id)
            .and_then(|roles| roles.get(&role))
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default()
    }

    // ── Introspection ───────────────────────────────────────────

    pub async fn viewers_is_empty(&self) -> bool {
        self.viewers.read().await.is_empty()
    }

    pub async fn uplinks_is_empty(&self) -> bool {
        self.uplinks.read().await.is_empty()
    }
}
