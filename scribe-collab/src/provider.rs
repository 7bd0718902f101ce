//! Transport provider adapter.
//!
//! Binds one [`SharedDocument`] and one [`AwarenessRegistry`] to a room over
//! a [`RealtimeTransport`]. All per-room-instance state lives behind a
//! [`RoomHandle`] that the editor binding, the seeding controller and the
//! cursor overlay share.
//!
//! ## Lifecycle
//!
//! ```text
//!            connect()                 SyncStep2
//! Disconnected ──────► Connecting ──► Connected ──────► Connected + synced
//!      ▲                                  │
//!      └──────── disconnect() / link lost ┘
//!
//! destroy(): any state ──► destroyed (terminal, later calls are no-ops)
//! ```
//!
//! `is_connected` and `is_synced` are distinct: after a reconnect the
//! adapter is connected but not synced until the handshake completes again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use scribe_core::{Selection, SharedDocument};

use crate::auth::RoomToken;
use crate::awareness::{AwarenessMessage, AwarenessRegistry};
use crate::config::CollabConfig;
use crate::protocol::{MessageType, PeerInfo, RoomId, SyncMessage};
use crate::seeding::SeedGuard;
use crate::transport::{ConnectRequest, RealtimeTransport, TransportEvent, TransportLink};

// ───────────────────────────────────────────────────────────────────
// Status and events
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderStatus {
    pub state: ConnectionState,
    pub synced: bool,
    pub destroyed: bool,
}

impl Default for ProviderStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            synced: false,
            destroyed: false,
        }
    }
}

/// What the UI shows next to the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionIndicator {
    Hidden,
    Connecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEventKind {
    Synced,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEvent {
    Synced(bool),
    Status(ConnectionState),
}

impl ProviderEvent {
    pub fn kind(&self) -> ProviderEventKind {
        match self {
            ProviderEvent::Synced(_) => ProviderEventKind::Synced,
            ProviderEvent::Status(_) => ProviderEventKind::Status,
        }
    }
}

pub type Listener = Arc<dyn Fn(&ProviderEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    entries: Vec<(ListenerId, ProviderEventKind, Listener)>,
}

/// Messages queued by the editor side for the pump.
#[derive(Debug)]
enum Outbound {
    Update(Vec<u8>),
    Awareness(AwarenessMessage),
    /// Announce departure and close the link.
    Close,
}

// ───────────────────────────────────────────────────────────────────
// Room handle
// ───────────────────────────────────────────────────────────────────

struct RoomShared {
    room: RoomId,
    peer: PeerInfo,
    document: Arc<SharedDocument>,
    awareness: Arc<AwarenessRegistry>,
    seed_guard: SeedGuard,
    status: watch::Sender<ProviderStatus>,
    changes: watch::Sender<u64>,
    outbound: mpsc::UnboundedSender<Outbound>,
    listeners: Mutex<ListenerTable>,
    clock: AtomicU64,
}

impl RoomShared {
    fn listeners(&self) -> MutexGuard<'_, ListenerTable> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Apply a status change and notify listeners of what actually changed.
    /// A destroyed room never changes again.
    fn update_status(&self, change: impl FnOnce(&mut ProviderStatus)) {
        let mut transition = None;
        self.status.send_if_modified(|status| {
            if status.destroyed {
                return false;
            }
            let before = *status;
            change(status);
            if *status == before {
                return false;
            }
            transition = Some((before, *status));
            true
        });

        if let Some((before, after)) = transition {
            if before.state != after.state {
                log::debug!("Room {} status {:?} -> {:?}", self.room, before.state, after.state);
                self.emit(ProviderEvent::Status(after.state));
            }
            if before.synced != after.synced {
                if after.synced {
                    log::info!("Room {} synced", self.room);
                }
                self.emit(ProviderEvent::Synced(after.synced));
            }
        }
    }

    fn emit(&self, event: ProviderEvent) {
        let listeners: Vec<Listener> = self
            .listeners()
            .entries
            .iter()
            .filter(|(_, kind, _)| *kind == event.kind())
            .map(|(_, _, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }

    fn notify_changed(&self) {
        self.changes.send_modify(|version| *version += 1);
    }
}

/// Shared, clonable view of one room instance.
#[derive(Clone)]
pub struct RoomHandle {
    shared: Arc<RoomShared>,
}

impl RoomHandle {
    pub fn room(&self) -> &RoomId {
        &self.shared.room
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.shared.peer
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.shared.document
    }

    pub fn awareness(&self) -> &Arc<AwarenessRegistry> {
        &self.shared.awareness
    }

    pub fn seed_guard(&self) -> &SeedGuard {
        &self.shared.seed_guard
    }

    pub fn status(&self) -> ProviderStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ProviderStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_synced(&self) -> bool {
        self.status().synced
    }

    pub fn is_connected(&self) -> bool {
        self.status().state == ConnectionState::Connected
    }

    pub fn is_destroyed(&self) -> bool {
        self.status().destroyed
    }

    pub fn indicator(&self) -> ConnectionIndicator {
        if self.is_connected() {
            ConnectionIndicator::Hidden
        } else {
            ConnectionIndicator::Connecting
        }
    }

    /// Wait until the first sync completes. `false` if the room was
    /// destroyed first.
    pub async fn wait_synced(&self) -> bool {
        let mut rx = self.shared.status.subscribe();
        let synced = match rx.wait_for(|status| status.synced || status.destroyed).await {
            Ok(status) => status.synced && !status.destroyed,
            Err(_) => false,
        };
        synced
    }

    /// Queue a local document update for broadcast.
    ///
    /// Dropped unless connected; the next handshake's state exchange carries
    /// offline edits.
    pub fn submit_update(&self, update: Vec<u8>) {
        self.shared.notify_changed();
        if !self.is_connected() {
            log::trace!("Room {} offline, update left to the next handshake", self.shared.room);
            return;
        }
        let _ = self.shared.outbound.send(Outbound::Update(update));
    }

    /// Record and publish the local selection. While offline only the
    /// local record changes; the next handshake announces it.
    pub fn publish_selection(&self, selection: Option<Selection>) {
        let message = self.shared.awareness.set_local_selection(selection);
        if !self.is_connected() {
            return;
        }
        let _ = self.shared.outbound.send(Outbound::Awareness(message));
    }

    /// Change counter bumped on every local or remote document change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    pub fn downgrade(&self) -> WeakRoomHandle {
        WeakRoomHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room", &self.shared.room)
            .field("peer", &self.shared.peer.peer_id)
            .field("status", &self.status())
            .finish()
    }
}

/// Non-owning handle; upgrading fails once every owner is gone.
#[derive(Clone)]
pub struct WeakRoomHandle {
    shared: Weak<RoomShared>,
}

impl WeakRoomHandle {
    pub fn upgrade(&self) -> Option<RoomHandle> {
        self.shared.upgrade().map(|shared| RoomHandle { shared })
    }
}

// ───────────────────────────────────────────────────────────────────
// Adapter
// ───────────────────────────────────────────────────────────────────

/// Owns the connection lifecycle of one room instance.
pub struct ProviderAdapter<T: RealtimeTransport> {
    transport: Arc<T>,
    token: RoomToken,
    handle: RoomHandle,
    outbound_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Outbound>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    channel_capacity: usize,
    renew_interval: Duration,
}

impl<T: RealtimeTransport> ProviderAdapter<T> {
    /// Build an adapter for the room named by `token`.
    pub fn new(
        transport: T,
        token: RoomToken,
        peer: PeerInfo,
        document: SharedDocument,
        config: &CollabConfig,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ProviderStatus::default());
        let (changes, _) = watch::channel(0);
        let awareness = Arc::new(AwarenessRegistry::new(&peer, config.presence_idle_timeout));

        let shared = RoomShared {
            room: token.room().clone(),
            peer,
            document: Arc::new(document),
            awareness,
            seed_guard: SeedGuard::new(),
            status,
            changes,
            outbound,
            listeners: Mutex::new(ListenerTable::default()),
            clock: AtomicU64::new(0),
        };

        Self {
            transport: Arc::new(transport),
            token,
            handle: RoomHandle {
                shared: Arc::new(shared),
            },
            outbound_rx: Arc::new(tokio::sync::Mutex::new(outbound_rx)),
            pump: Mutex::new(None),
            channel_capacity: config.channel_capacity,
            renew_interval: config.awareness_renew_interval,
        }
    }

    pub fn handle(&self) -> &RoomHandle {
        &self.handle
    }

    pub fn is_synced(&self) -> bool {
        self.handle.is_synced()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle.is_destroyed()
    }

    fn pump(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the session. No-op while a session is running or after destroy.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        if self.is_destroyed() {
            log::debug!("connect() on destroyed room {}", self.handle.room());
            return;
        }
        let mut pump = self.pump();
        if pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let shared = self.handle.shared.clone();
        shared.update_status(|s| s.state = ConnectionState::Connecting);

        let request = ConnectRequest {
            room: shared.room.clone(),
            token: self.token.clone(),
            peer: shared.peer.clone(),
            channel_capacity: self.channel_capacity,
        };
        let transport = self.transport.clone();
        let outbound = self.outbound_rx.clone();
        let renew = self.renew_interval;

        *pump = Some(tokio::spawn(async move {
            run_session(transport, request, shared, outbound, renew).await;
        }));
    }

    /// Suspend the session: announce departure, close the link, keep state.
    /// Idempotent.
    pub async fn disconnect(&self) {
        let task = self.pump().take();
        let Some(mut task) = task else {
            return;
        };
        if !task.is_finished() {
            let _ = self.handle.shared.outbound.send(Outbound::Close);
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
            }
        }
        let shared = &self.handle.shared;
        shared.awareness.clear_remote();
        shared.update_status(|s| {
            s.state = ConnectionState::Disconnected;
            s.synced = false;
        });
        log::debug!("Room {} disconnected", shared.room);
    }

    /// Tear down for good. Only the first call has an effect.
    pub fn destroy(&self) {
        let shared = &self.handle.shared;
        let effective = shared.status.send_if_modified(|status| {
            if status.destroyed {
                return false;
            }
            *status = ProviderStatus {
                state: ConnectionState::Disconnected,
                synced: false,
                destroyed: true,
            };
            true
        });
        if !effective {
            return;
        }

        if let Some(task) = self.pump().take() {
            task.abort();
        }
        shared.listeners().entries.clear();
        shared.awareness.clear_remote();
        log::info!("Room {} destroyed", shared.room);
    }

    /// Register a listener. Ignored after destroy.
    pub fn on(
        &self,
        kind: ProviderEventKind,
        listener: impl Fn(&ProviderEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut table = self.handle.shared.listeners();
        table.next_id += 1;
        let id = ListenerId(table.next_id);
        if !self.is_destroyed() {
            table.entries.push((id, kind, Arc::new(listener)));
        }
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn off(&self, kind: ProviderEventKind, id: ListenerId) {
        self.handle
            .shared
            .listeners()
            .entries
            .retain(|(entry_id, entry_kind, _)| !(*entry_id == id && *entry_kind == kind));
    }
}

impl<T: RealtimeTransport> Drop for ProviderAdapter<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ───────────────────────────────────────────────────────────────────
// Session pump
// ───────────────────────────────────────────────────────────────────

async fn run_session<T: RealtimeTransport>(
    transport: Arc<T>,
    request: ConnectRequest,
    shared: Arc<RoomShared>,
    outbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Outbound>>>,
    renew: Duration,
) {
    let room = request.room.clone();
    let TransportLink {
        outgoing,
        mut incoming,
    } = match transport.open(request).await {
        Ok(link) => link,
        Err(e) => {
            log::warn!("Failed to open room {room}: {e}");
            shared.update_status(|s| {
                s.state = ConnectionState::Disconnected;
                s.synced = false;
            });
            return;
        }
    };

    let mut outbound = outbound.lock().await;
    let mut renew_timer = tokio::time::interval_at(tokio::time::Instant::now() + renew, renew);
    // Frames waiting for channel capacity. Only the `reserve` branch writes
    // to `outgoing`, so a full channel never stops `incoming` from draining.
    let mut backlog: VecDeque<SyncMessage> = VecDeque::new();
    let mut closing = false;

    loop {
        if closing && backlog.is_empty() {
            break;
        }

        tokio::select! {
            biased;

            permit = outgoing.reserve(), if !backlog.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(msg) = backlog.pop_front() {
                        permit.send(msg);
                    }
                }
                Err(_) => break,
            },

            event = incoming.recv() => match event {
                Some(TransportEvent::Connected) => {
                    // The handshake carries everything queued while offline.
                    while let Ok(queued) = outbound.try_recv() {
                        if matches!(queued, Outbound::Close) {
                            closing = true;
                        }
                    }
                    if closing {
                        continue;
                    }
                    shared.update_status(|s| s.state = ConnectionState::Connected);
                    match handshake_messages(&shared) {
                        Some(messages) => backlog.extend(messages),
                        None => break,
                    }
                }
                Some(TransportEvent::Message(msg)) => {
                    backlog.extend(handle_inbound(&shared, msg));
                }
                Some(TransportEvent::Disconnected) | None => break,
            },

            Some(queued) = outbound.recv(), if !closing => match queued {
                Outbound::Update(update) => {
                    let clock = shared.next_clock();
                    let peer_id = shared.peer.peer_id;
                    backlog.push_back(SyncMessage::update(peer_id, room.as_str(), clock, update));
                }
                Outbound::Awareness(message) => {
                    backlog.extend(awareness_message(&shared, &message));
                }
                Outbound::Close => {
                    let leave = shared.awareness.leave_message();
                    backlog.extend(awareness_message(&shared, &leave));
                    closing = true;
                }
            },

            _ = renew_timer.tick(), if !closing => {
                shared.awareness.cleanup_idle_peers();
                let join = shared.awareness.join_message();
                backlog.extend(awareness_message(&shared, &join));
            }
        }
    }

    shared.awareness.clear_remote();
    shared.update_status(|s| {
        s.state = ConnectionState::Disconnected;
        s.synced = false;
    });
    log::debug!("Session for room {room} ended");
}

fn awareness_message(shared: &RoomShared, message: &AwarenessMessage) -> Option<SyncMessage> {
    match SyncMessage::awareness(
        shared.peer.peer_id,
        shared.room.as_str(),
        shared.next_clock(),
        message,
    ) {
        Ok(msg) => Some(msg),
        Err(e) => {
            log::warn!("Failed to encode presence: {e}");
            None
        }
    }
}

/// Join, request the remote state, announce presence. `None` if the join
/// itself cannot be encoded.
fn handshake_messages(shared: &RoomShared) -> Option<Vec<SyncMessage>> {
    let room = shared.room.as_str();
    let joined = match SyncMessage::peer_joined(room, &shared.peer) {
        Ok(msg) => msg,
        Err(e) => {
            log::error!("Failed to encode join for {room}: {e}");
            return None;
        }
    };
    let step1 = SyncMessage::sync_step1(shared.peer.peer_id, room, shared.document.state_vector());
    let presence = awareness_message(shared, &shared.awareness.join_message());

    Some([Some(joined), Some(step1), presence].into_iter().flatten().collect())
}

/// Apply one inbound frame and return the replies it calls for.
fn handle_inbound(shared: &RoomShared, msg: SyncMessage) -> Option<SyncMessage> {
    match msg.msg_type {
        MessageType::Update | MessageType::SyncStep2 => {
            match shared.document.apply_update(&msg.payload) {
                Ok(()) => {
                    shared.notify_changed();
                    if msg.msg_type == MessageType::SyncStep2 {
                        shared.update_status(|s| s.synced = true);
                    }
                }
                Err(e) => log::warn!("Ignoring bad {:?} in {}: {e}", msg.msg_type, shared.room),
            }
        }

        MessageType::SyncStep1 => match shared.document.encode_diff(&msg.payload) {
            Ok(diff) => {
                let room = shared.room.as_str();
                return Some(SyncMessage::sync_step2(shared.peer.peer_id, room, diff));
            }
            Err(e) => log::warn!("Ignoring bad state vector in {}: {e}", shared.room),
        },

        MessageType::Awareness => match msg.awareness_message() {
            Ok(message) => {
                shared.awareness.handle_message(&message);
            }
            Err(e) => log::warn!("Ignoring bad presence in {}: {e}", shared.room),
        },

        MessageType::PeerJoined => match msg.peer_info() {
            Ok(info) => {
                log::debug!("{} joined {}", info.name, shared.room);
                shared.awareness.upsert_peer(&info);
            }
            Err(e) => log::warn!("Ignoring bad peer info in {}: {e}", shared.room),
        },

        MessageType::PeerLeft => {
            shared.awareness.remove_peer(&msg.peer_id);
        }

        MessageType::Ping => return Some(SyncMessage::pong(shared.peer.peer_id)),

        MessageType::Pong => log::trace!("Pong in {}", shared.room),
    }
    None
}
