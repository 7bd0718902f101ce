//! Realtime transports.
//!
//! A transport opens one session per [`ConnectRequest`] and hands back a
//! [`TransportLink`]: a sender for outgoing protocol messages and a receiver
//! of connection events. Dropping the link's sender ends the session.
//! Transports never retry; reconnecting is the caller's decision.

use std::future::Future;
use tokio::sync::mpsc;

use crate::auth::RoomToken;
use crate::protocol::{PeerInfo, ProtocolError, RoomId, SyncMessage};

pub mod memory;
pub mod websocket;

pub use memory::LocalTransport;
pub use websocket::WebSocketTransport;

/// Events delivered to the session owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Message(SyncMessage),
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub room: RoomId,
    pub token: RoomToken,
    pub peer: PeerInfo,
    pub channel_capacity: usize,
}

/// Both ends of an open session.
#[derive(Debug)]
pub struct TransportLink {
    pub outgoing: mpsc::Sender<SyncMessage>,
    pub incoming: mpsc::Receiver<TransportEvent>,
}

pub trait RealtimeTransport: Send + Sync + 'static {
    fn open(
        &self,
        request: ConnectRequest,
    ) -> impl Future<Output = Result<TransportLink, ProtocolError>> + Send;
}
