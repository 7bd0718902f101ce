//! Room relay: the service end every transport talks to.
//!
//! ```text
//! session A ──┐                    ┌── authoritative SharedDocument
//!             ├── RelayRoom(room) ─┼── BroadcastGroup (fan-out)
//! session B ──┘                    └── presence cache (last full state per peer)
//! ```
//!
//! A session starts with a `PeerJoined` message. The newcomer is told
//! about everyone already present (profile and cached presence), then its
//! own arrival is fanned out. Document traffic follows the state-vector
//! handshake: `SyncStep1` is answered with `SyncStep2` plus the relay's own
//! `SyncStep1`; whatever comes back (`SyncStep2` or `Update`) is merged and
//! fanned out as `Update`.
//!
//! A peer that reconnects before its previous session has left replaces
//! that session's registration. The stale session's `leave` then only
//! drops its own receiver: no `PeerLeft`, no presence eviction, and the
//! room stays.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use uuid::Uuid;

use scribe_core::SharedDocument;

use crate::awareness::AwarenessMessage;
use crate::broadcast::BroadcastGroup;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

struct RelayRoom {
    doc: SharedDocument,
    broadcast: BroadcastGroup,
    presence: Mutex<HashMap<Uuid, AwarenessMessage>>,
}

impl RelayRoom {
    fn new(capacity: usize) -> Self {
        Self {
            doc: SharedDocument::new(),
            broadcast: BroadcastGroup::new(capacity),
            presence: Mutex::new(HashMap::new()),
        }
    }

    fn presence(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, AwarenessMessage>> {
        self.presence.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory room service shared by every connection.
pub struct RoomRelay {
    rooms: RwLock<HashMap<String, Arc<RelayRoom>>>,
    broadcast_capacity: usize,
    max_peers_per_room: usize,
}

impl RoomRelay {
    pub fn new(broadcast_capacity: usize, max_peers_per_room: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
            max_peers_per_room,
        }
    }

    /// Start a session from its opening `PeerJoined` message.
    ///
    /// Returns the session plus the messages to deliver to the newcomer
    /// right away.
    pub async fn accept(
        self: &Arc<Self>,
        first: SyncMessage,
    ) -> Result<(RelaySession, Vec<SyncMessage>), ProtocolError> {
        if first.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let info = first
            .peer_info()
            .unwrap_or_else(|_| PeerInfo::with_id(first.peer_id, "Anonymous"));
        let room_id = first.room;

        // Joining under the write lock keeps `leave` from removing the room
        // between lookup and registration.
        let (room, registration, rx) = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(RelayRoom::new(self.broadcast_capacity)))
                .clone();
            let rejoin = room.broadcast.has_peer(&info.peer_id).await;
            if !rejoin && room.broadcast.peer_count().await >= self.max_peers_per_room {
                return Err(ProtocolError::ConnectionFailed(format!(
                    "room {room_id} is full"
                )));
            }
            let (registration, rx) = room.broadcast.register(info.clone()).await;
            (room, registration, rx)
        };

        let mut welcome = Vec::new();
        for peer in room.broadcast.peers().await {
            if peer.peer_id == info.peer_id {
                continue;
            }
            welcome.push(SyncMessage::peer_joined(&room_id, &peer)?);
        }
        let cached: Vec<(Uuid, AwarenessMessage)> = room
            .presence()
            .iter()
            .filter(|(id, _)| **id != info.peer_id)
            .map(|(id, state)| (*id, state.clone()))
            .collect();
        for (peer_id, state) in cached {
            welcome.push(SyncMessage::awareness(peer_id, &room_id, 0, &state)?);
        }

        room.broadcast.broadcast(&SyncMessage::peer_joined(&room_id, &info)?)?;
        log::info!("Peer {} ({}) joined room {room_id}", info.name, info.peer_id);

        Ok((
            RelaySession {
                relay: Arc::clone(self),
                peer_id: info.peer_id,
                registration,
                room_id,
                room,
                rx,
            },
            welcome,
        ))
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn peer_count(&self, room: &str) -> usize {
        let room = self.rooms.read().await.get(room).cloned();
        match room {
            Some(room) => room.broadcast.peer_count().await,
            None => 0,
        }
    }

    /// Full document state of a live room.
    pub async fn room_state(&self, room: &str) -> Option<Vec<u8>> {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|room| room.doc.encode_state())
    }
}

impl Default for RoomRelay {
    fn default() -> Self {
        Self::new(256, 100)
    }
}

/// One connection's view of a relay room.
pub struct RelaySession {
    relay: Arc<RoomRelay>,
    peer_id: Uuid,
    registration: u64,
    room_id: String,
    room: Arc<RelayRoom>,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

impl RelaySession {
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn room(&self) -> &str {
        &self.room_id
    }

    /// Process one inbound message; returns direct replies for this peer.
    pub fn handle(&self, msg: SyncMessage) -> Result<Vec<SyncMessage>, ProtocolError> {
        let room = &self.room;
        match msg.msg_type {
            MessageType::SyncStep1 => {
                let diff = match room.doc.encode_diff(&msg.payload) {
                    Ok(diff) => diff,
                    Err(e) => {
                        log::warn!("Bad state vector from {}: {e}", self.peer_id);
                        return Ok(Vec::new());
                    }
                };
                Ok(vec![
                    SyncMessage::sync_step2(Uuid::nil(), &self.room_id, diff),
                    SyncMessage::sync_step1(Uuid::nil(), &self.room_id, room.doc.state_vector()),
                ])
            }

            MessageType::SyncStep2 | MessageType::Update => {
                if let Err(e) = room.doc.apply_update(&msg.payload) {
                    log::warn!("Dropping bad update from {}: {e}", self.peer_id);
                    return Ok(Vec::new());
                }
                let fan_out =
                    SyncMessage::update(self.peer_id, &self.room_id, msg.clock, msg.payload);
                room.broadcast.broadcast(&fan_out)?;
                Ok(Vec::new())
            }

            MessageType::Awareness => {
                let state = match msg.awareness_message() {
                    Ok(state) => state,
                    Err(e) => {
                        log::warn!("Bad presence payload from {}: {e}", self.peer_id);
                        return Ok(Vec::new());
                    }
                };
                if state.user_id() != self.peer_id {
                    log::warn!(
                        "Peer {} sent presence for {}, ignoring",
                        self.peer_id,
                        state.user_id()
                    );
                    return Ok(Vec::new());
                }
                {
                    let mut presence = room.presence();
                    match state {
                        AwarenessMessage::Leave { .. } => {
                            presence.remove(&self.peer_id);
                        }
                        other => {
                            let previous = presence.remove(&self.peer_id);
                            if let Some(merged) = other.merged_into(previous) {
                                presence.insert(self.peer_id, merged);
                            }
                        }
                    }
                }
                room.broadcast.broadcast(&msg)?;
                Ok(Vec::new())
            }

            MessageType::Ping => Ok(vec![SyncMessage::pong(self.peer_id)]),

            MessageType::Pong => Ok(Vec::new()),

            MessageType::PeerJoined | MessageType::PeerLeft => {
                log::debug!("Ignoring {:?} from {} mid-session", msg.msg_type, self.peer_id);
                Ok(Vec::new())
            }
        }
    }

    /// Next fanned-out message addressed to this peer.
    ///
    /// Own messages are skipped. After falling behind, the full document
    /// state is delivered instead of the missed updates. `None` once the room
    /// is gone.
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        loop {
            match self.rx.recv().await {
                Ok(bytes) => match SyncMessage::decode(&bytes) {
                    Ok(msg) if msg.peer_id == self.peer_id => continue,
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        log::warn!("Undecodable fan-out message: {e}");
                        continue;
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Peer {} lagged by {skipped} messages", self.peer_id);
                    self.room.broadcast.record_lag(skipped);
                    return Some(SyncMessage::update(
                        Uuid::nil(),
                        &self.room_id,
                        0,
                        self.room.doc.encode_state(),
                    ));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// End the session, announce it and drop the room once empty.
    ///
    /// A session superseded by a newer one for the same peer leaves
    /// silently.
    pub async fn leave(self) {
        let mut rooms = self.relay.rooms.write().await;
        let released = self
            .room
            .broadcast
            .release(&self.peer_id, self.registration)
            .await;
        if released.is_none() {
            log::debug!(
                "Superseded session of {} left room {}",
                self.peer_id,
                self.room_id
            );
            return;
        }

        self.room.presence().remove(&self.peer_id);
        let _ = self
            .room
            .broadcast
            .broadcast(&SyncMessage::peer_left(self.peer_id, &self.room_id));

        let current = rooms
            .get(&self.room_id)
            .is_some_and(|room| Arc::ptr_eq(room, &self.room));
        if current && self.room.broadcast.peer_count().await == 0 {
            rooms.remove(&self.room_id);
            log::info!("Room {} removed (empty)", self.room_id);
        }
        log::info!("Peer {} left room {}", self.peer_id, self.room_id);
    }
}
