//! WebSocket transport.
//!
//! Connects to `{server_url}/{room}?token={secret}`, with the room encoded
//! as a single path segment and the token as a form-encoded query pair,
//! and runs two tasks:
//! a writer draining the outgoing channel into the socket, and a reader
//! decoding binary frames into [`TransportEvent::Message`]s. When the
//! link's sender is dropped the writer closes the socket.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::protocol::{ProtocolError, SyncMessage};

use super::{ConnectRequest, RealtimeTransport, TransportEvent, TransportLink};

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    server_url: String,
}

impl WebSocketTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn room_url(&self, request: &ConnectRequest) -> Result<Url, ProtocolError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| ProtocolError::ConnectionFailed(format!("invalid server url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ProtocolError::ConnectionFailed("server url has no path".to_string()))?
            .pop_if_empty()
            .push(request.room.as_str());
        url.query_pairs_mut()
            .clear()
            .append_pair("token", request.token.secret());
        Ok(url)
    }
}

impl RealtimeTransport for WebSocketTransport {
    async fn open(&self, request: ConnectRequest) -> Result<TransportLink, ProtocolError> {
        let url = self.room_url(&request)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::debug!("WebSocket open for room {}", request.room);

        let capacity = request.channel_capacity.max(1);
        let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);

        in_tx
            .send(TransportEvent::Connected)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        // Writer task: outgoing channel → socket
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let encoded = match msg.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::warn!("Dropping unencodable message: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: socket → events
        let room = request.room;
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(msg) => {
                            if in_tx.send(TransportEvent::Message(msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame in room {room}: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("WebSocket error in room {room}: {e}");
                        break;
                    }
                }
            }
            let _ = in_tx.send(TransportEvent::Disconnected).await;
            log::debug!("WebSocket closed for room {room}");
        });

        Ok(TransportLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
