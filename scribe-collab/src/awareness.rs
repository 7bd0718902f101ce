//! Presence protocol: who is in the room and where their selection is.
//!
//! Presence is ephemeral. It travels next to the document (inside
//! `SyncMessage::Awareness` payloads) but is never merged into it.
//!
//! ## Data flow
//!
//! ```text
//! local selection change
//!       │
//!       ▼
//! AwarenessRegistry::set_local_selection()  ── AwarenessMessage::Selection
//!       │                                         (per-sender clock)
//!       ▼   (transport)
//! remote AwarenessRegistry::handle_message()
//!       │  (stale clocks rejected, last write wins per field)
//!       ▼
//! entries() / subscribe()  ──►  cursor overlay
//! ```
//!
//! Ordering between presence updates and document updates from the same
//! peer is not guaranteed; consumers treat them as independent streams.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use scribe_core::Selection;

use crate::protocol::PeerInfo;

// ───────────────────────────────────────────────────────────────────
// Color
// ───────────────────────────────────────────────────────────────────

/// RGBA color for caret and label rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Generate a stable, visually distinct color from a UUID.
    ///
    /// The hue comes from the UUID bits; saturation and lightness are
    /// fixed so labels stay readable on a light background.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.45);
        Self { r, g, b, a: 1.0 }
    }

    /// Create from RGBA components.
    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb` form for style attributes.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 } // Default blue
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Presence messages carried inside awareness payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    /// Full state: announce on connect and periodic renewal.
    Join {
        user_id: Uuid,
        user_name: String,
        user_color: CursorColor,
        selection: Option<Selection>,
        clock: u64,
    },

    /// Selection changed (`None` = not focused).
    Selection {
        user_id: Uuid,
        selection: Option<Selection>,
        clock: u64,
    },

    /// Clean disconnect.
    Leave { user_id: Uuid },
}

impl AwarenessMessage {
    pub fn user_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { user_id, .. } => *user_id,
            AwarenessMessage::Selection { user_id, .. } => *user_id,
            AwarenessMessage::Leave { user_id } => *user_id,
        }
    }

    /// Fold a newer partial message into a full `Join` state.
    ///
    /// Returns `None` when there is no full state to fold into yet.
    pub fn merged_into(self, previous: Option<AwarenessMessage>) -> Option<AwarenessMessage> {
        match (self, previous) {
            (join @ AwarenessMessage::Join { .. }, _) => Some(join),
            (
                AwarenessMessage::Selection { selection, clock, .. },
                Some(AwarenessMessage::Join {
                    user_id,
                    user_name,
                    user_color,
                    selection: old_selection,
                    clock: old_clock,
                }),
            ) => {
                let (selection, clock) = if clock >= old_clock {
                    (selection, clock)
                } else {
                    (old_selection, old_clock)
                };
                Some(AwarenessMessage::Join {
                    user_id,
                    user_name,
                    user_color,
                    selection,
                    clock,
                })
            }
            _ => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Entries
// ───────────────────────────────────────────────────────────────────

/// One connection's presence as seen locally.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub connection_id: Uuid,
    pub name: String,
    pub color: CursorColor,
    pub selection: Option<Selection>,
}

impl PresenceEntry {
    fn placeholder(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            name: format!("Peer-{}", &connection_id.to_string()[..8]),
            color: CursorColor::from_uuid(connection_id),
            selection: None,
        }
    }
}

#[derive(Debug, Clone)]
struct RemotePresence {
    entry: PresenceEntry,
    last_update: Instant,
    /// Highest sender clock applied so far.
    last_clock: u64,
}

impl RemotePresence {
    fn new(entry: PresenceEntry) -> Self {
        Self {
            entry,
            last_update: Instant::now(),
            last_clock: 0,
        }
    }

    /// Apply a clocked update; stale clocks are rejected.
    fn accept(&mut self, clock: u64) -> bool {
        if clock < self.last_clock {
            return false;
        }
        self.last_clock = clock;
        self.last_update = Instant::now();
        true
    }
}

struct PresenceState {
    local: PresenceEntry,
    local_clock: u64,
    peers: HashMap<Uuid, RemotePresence>,
}

impl PresenceState {
    fn next_clock(&mut self) -> u64 {
        self.local_clock += 1;
        self.local_clock
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// Presence of every connection in one room.
///
/// The local entry is owned here and published through messages returned
/// by the mutators; remote entries are written only from messages carrying
/// their own connection id.
pub struct AwarenessRegistry {
    state: Mutex<PresenceState>,
    idle_timeout: Duration,
    changes: watch::Sender<u64>,
}

impl AwarenessRegistry {
    pub fn new(local: &PeerInfo, idle_timeout: Duration) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(PresenceState {
                local: PresenceEntry {
                    connection_id: local.peer_id,
                    name: local.name.clone(),
                    color: local.color,
                    selection: None,
                },
                local_clock: 0,
                peers: HashMap::new(),
            }),
            idle_timeout,
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    pub fn local_id(&self) -> Uuid {
        self.lock().local.connection_id
    }

    pub fn local(&self) -> PresenceEntry {
        self.lock().local.clone()
    }

    /// Record the local selection and return the message to publish.
    pub fn set_local_selection(&self, selection: Option<Selection>) -> AwarenessMessage {
        let mut state = self.lock();
        state.local.selection = selection;
        let clock = state.next_clock();
        AwarenessMessage::Selection {
            user_id: state.local.connection_id,
            selection,
            clock,
        }
    }

    /// Full local state, used on connect and for renewal.
    pub fn join_message(&self) -> AwarenessMessage {
        let mut state = self.lock();
        let clock = state.next_clock();
        AwarenessMessage::Join {
            user_id: state.local.connection_id,
            user_name: state.local.name.clone(),
            user_color: state.local.color,
            selection: state.local.selection,
            clock,
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            user_id: self.local_id(),
        }
    }

    /// Apply a remote presence message. Returns `true` if anything changed.
    pub fn handle_message(&self, msg: &AwarenessMessage) -> bool {
        let changed = {
            let mut state = self.lock();
            if msg.user_id() == state.local.connection_id {
                return false;
            }

            match msg {
                AwarenessMessage::Join {
                    user_id,
                    user_name,
                    user_color,
                    selection,
                    clock,
                } => {
                    let peer = state.peers.entry(*user_id).or_insert_with(|| {
                        RemotePresence::new(PresenceEntry::placeholder(*user_id))
                    });
                    if peer.accept(*clock) {
                        let before = peer.entry.clone();
                        peer.entry.name = user_name.clone();
                        peer.entry.color = *user_color;
                        peer.entry.selection = *selection;
                        peer.entry != before
                    } else {
                        false
                    }
                }

                AwarenessMessage::Selection {
                    user_id,
                    selection,
                    clock,
                } => {
                    // Known peers arrive through PeerJoined or Join first; a
                    // selection for anyone else is a straggler from a peer
                    // that already left.
                    let Some(peer) = state.peers.get_mut(user_id) else {
                        log::trace!("Selection from unknown peer {user_id} ignored");
                        return false;
                    };
                    if peer.accept(*clock) && peer.entry.selection != *selection {
                        peer.entry.selection = *selection;
                        true
                    } else {
                        false
                    }
                }

                AwarenessMessage::Leave { user_id } => state.peers.remove(user_id).is_some(),
            }
        };

        if changed {
            self.notify();
        }
        changed
    }

    /// Register a peer announced by the room (name and color only).
    pub fn upsert_peer(&self, info: &PeerInfo) -> bool {
        let changed = {
            let mut state = self.lock();
            if info.peer_id == state.local.connection_id {
                return false;
            }
            let peer = state
                .peers
                .entry(info.peer_id)
                .or_insert_with(|| RemotePresence::new(PresenceEntry::placeholder(info.peer_id)));
            peer.last_update = Instant::now();
            let before = peer.entry.clone();
            peer.entry.name = info.name.clone();
            peer.entry.color = info.color;
            peer.entry != before
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Drop a peer whose connection closed.
    pub fn remove_peer(&self, peer_id: &Uuid) -> bool {
        let removed = self.lock().peers.remove(peer_id).is_some();
        if removed {
            self.notify();
        }
        removed
    }

    /// Forget every remote entry (local connection dropped).
    pub fn clear_remote(&self) {
        let had_peers = {
            let mut state = self.lock();
            let had = !state.peers.is_empty();
            state.peers.clear();
            had
        };
        if had_peers {
            self.notify();
        }
    }

    /// Remove peers that have not renewed within the idle timeout.
    pub fn cleanup_idle_peers(&self) -> Vec<Uuid> {
        let stale: Vec<Uuid> = {
            let mut state = self.lock();
            let stale: Vec<Uuid> = state
                .peers
                .iter()
                .filter(|(_, p)| p.last_update.elapsed() > self.idle_timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                state.peers.remove(id);
            }
            stale
        };
        if !stale.is_empty() {
            log::debug!("Dropped {} idle presence entries", stale.len());
            self.notify();
        }
        stale
    }

    /// Remote entries ordered by connection id.
    pub fn entries(&self) -> Vec<PresenceEntry> {
        let state = self.lock();
        let mut entries: Vec<PresenceEntry> =
            state.peers.values().map(|p| p.entry.clone()).collect();
        entries.sort_by_key(|e| e.connection_id);
        entries
    }

    pub fn entry(&self, connection_id: &Uuid) -> Option<PresenceEntry> {
        self.lock().peers.get(connection_id).map(|p| p.entry.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    /// Change counter; bumps whenever the remote view changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

// ===================================================================
// Tests
// ===================================================================
