//! WebSocket front of the room relay.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/{room}?token=…
//!            ├── SyncServer ── RoomRelay ── RelayRoom(room)
//! Client B ──┘                                 ├── SharedDocument
//!                                              ├── BroadcastGroup
//!                                              └── presence cache
//! ```
//!
//! Every connection is one [`RelaySession`], opened by the client's first
//! `PeerJoined` frame. Nothing is persisted: a room lives while at least
//! one peer is connected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use percent_encoding::percent_decode_str;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use url::form_urlencoded;
use uuid::Uuid;

use crate::protocol::{MessageType, SyncMessage};
use crate::relay::{RelaySession, RoomRelay};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
    /// Token every client must present (None = open server)
    pub access_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            access_secret: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_handshakes: u64,
}

/// Target of an upgrade request: room from the path, token from the query.
///
/// Both are decoded; a path that is not valid UTF-8 once decoded yields an
/// empty room, which the handshake rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RoomTarget {
    room: String,
    token: Option<String>,
}

impl RoomTarget {
    fn from_request(request: &Request) -> Self {
        let uri = request.uri();
        let token = uri.query().and_then(|query| {
            form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "token")
                .map(|(_, value)| value.into_owned())
        });
        let path = uri.path().trim_start_matches('/');
        let room = percent_decode_str(path)
            .decode_utf8()
            .map(|room| room.into_owned())
            .unwrap_or_default();
        Self { room, token }
    }
}

pub struct SyncServer {
    config: ServerConfig,
    relay: Arc<RoomRelay>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let relay = Arc::new(RoomRelay::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            relay,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, relay, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: Arc<RoomRelay>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let mut target: Option<RoomTarget> = None;
        let secret = config.access_secret.clone();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let parsed = RoomTarget::from_request(request);
            let authorized = match &secret {
                Some(secret) => parsed.token.as_deref() == Some(secret.as_str()),
                None => true,
            };
            if !authorized || parsed.room.is_empty() {
                let mut denied = ErrorResponse::new(Some("room access denied".to_string()));
                *denied.status_mut() = StatusCode::UNAUTHORIZED;
                return Err(denied);
            }
            target = Some(parsed);
            Ok(response)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                stats.write().await.rejected_handshakes += 1;
                log::warn!("Handshake from {addr} rejected: {e}");
                return Ok(());
            }
        };
        let Some(target) = target else {
            return Ok(());
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection from {addr} for room {}", target.room);

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<RelaySession> = None;
        let heartbeat = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let first_tick = tokio::time::Instant::now() + heartbeat;
        let mut ticker = tokio::time::interval_at(first_tick, heartbeat);

        let result = async {
            loop {
                tokio::select! {
                    frame = ws_receiver.next() => {
                        match frame {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                let msg = match SyncMessage::decode(&data) {
                                    Ok(msg) => msg,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };

                                let replies = match &session {
                                    Some(session) => session.handle(msg)?,
                                    None => {
                                        let opening = msg.msg_type == MessageType::PeerJoined
                                            && msg.room == target.room;
                                        if !opening {
                                            log::warn!(
                                                "Unexpected opening {:?} from {addr}",
                                                msg.msg_type
                                            );
                                            break;
                                        }
                                        let (opened, welcome) = relay.accept(msg).await?;
                                        session = Some(opened);
                                        welcome
                                    }
                                };
                                for reply in replies {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }

                    fanned = async {
                        match session.as_mut() {
                            Some(session) => session.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        let Some(msg) = fanned else { break };
                        ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                    }

                    _ = ticker.tick(), if config.heartbeat_interval_secs > 0 => {
                        if session.is_some() {
                            let ping = SyncMessage::ping(Uuid::nil());
                            ws_sender.send(Message::Binary(ping.encode()?.into())).await?;
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        if let Some(session) = session {
            session.leave().await;
        }
        stats.write().await.active_connections -= 1;
        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn relay(&self) -> &Arc<RoomRelay> {
        &self.relay
    }
}
