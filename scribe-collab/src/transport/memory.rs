//! In-process transport wired straight into a [`RoomRelay`].

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::protocol::{ProtocolError, SyncMessage};
use crate::relay::RoomRelay;

use super::{ConnectRequest, RealtimeTransport, TransportEvent, TransportLink};

/// Connects providers to a relay living in the same process.
#[derive(Clone)]
pub struct LocalTransport {
    relay: Arc<RoomRelay>,
}

impl LocalTransport {
    pub fn new(relay: Arc<RoomRelay>) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &Arc<RoomRelay> {
        &self.relay
    }
}

impl RealtimeTransport for LocalTransport {
    async fn open(&self, request: ConnectRequest) -> Result<TransportLink, ProtocolError> {
        let capacity = request.channel_capacity.max(1);
        let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let relay = self.relay.clone();
        let room = request.room;

        in_tx
            .send(TransportEvent::Connected)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        tokio::spawn(async move {
            // The first message opens the relay session.
            let Some(first) = out_rx.recv().await else {
                return;
            };
            if first.room != room.as_str() {
                log::warn!("Join for {} on a link opened for {room}", first.room);
                let _ = in_tx.send(TransportEvent::Disconnected).await;
                return;
            }
            let (mut session, welcome) = match relay.accept(first).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Relay refused session for {room}: {e}");
                    let _ = in_tx.send(TransportEvent::Disconnected).await;
                    return;
                }
            };

            let mut open = true;
            for msg in welcome {
                if in_tx.send(TransportEvent::Message(msg)).await.is_err() {
                    open = false;
                    break;
                }
            }

            while open {
                tokio::select! {
                    outgoing = out_rx.recv() => {
                        let Some(msg) = outgoing else { break };
                        match session.handle(msg) {
                            Ok(replies) => {
                                for reply in replies {
                                    if in_tx.send(TransportEvent::Message(reply)).await.is_err() {
                                        open = false;
                                        break;
                                    }
                                }
                            }
                            Err(e) => log::warn!("Relay rejected message: {e}"),
                        }
                    }
                    fanned = session.recv() => {
                        let Some(msg) = fanned else { break };
                        if in_tx.send(TransportEvent::Message(msg)).await.is_err() {
                            break;
                        }
                    }
                }
            }

            session.leave().await;
            let _ = in_tx.send(TransportEvent::Disconnected).await;
            log::debug!("Local link for {room} closed");
        });

        Ok(TransportLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
