//! Room authorization.
//!
//! A [`RoomToken`] can only be obtained from a [`RoomAuthorizer`], and a
//! provider adapter can only be built from a token, so a room the user may
//! not open never reaches the transport.

use std::collections::HashSet;
use std::future::Future;

use crate::protocol::{PeerInfo, RoomId};

/// Proof that a peer may open a room.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomToken {
    room: RoomId,
    secret: String,
}

impl RoomToken {
    /// Mint a token. Only authorizers should call this.
    pub fn issue(room: RoomId, secret: impl Into<String>) -> Self {
        Self {
            room,
            secret: secret.into(),
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Opaque credential passed on to the transport.
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for RoomToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomToken")
            .field("room", &self.room)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    Denied { room: RoomId },
    Unavailable(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Denied { room } => write!(f, "Access to room {room} denied"),
            Self::Unavailable(e) => write!(f, "Authorization unavailable: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Grants access to rooms.
pub trait RoomAuthorizer: Send + Sync {
    fn authorize(
        &self,
        room: &RoomId,
        peer: &PeerInfo,
    ) -> impl Future<Output = Result<RoomToken, AuthError>> + Send;
}

/// Fixed policy: everything, or an allow-list of rooms.
#[derive(Debug, Clone)]
pub struct StaticAuthorizer {
    allowed: Option<HashSet<RoomId>>,
    secret: String,
}

impl StaticAuthorizer {
    pub fn allow_all() -> Self {
        Self {
            allowed: None,
            secret: "static".to_string(),
        }
    }

    pub fn allow_rooms<I>(rooms: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<RoomId>,
    {
        Self {
            allowed: Some(rooms.into_iter().map(Into::into).collect()),
            secret: "static".to_string(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }
}

impl RoomAuthorizer for StaticAuthorizer {
    async fn authorize(&self, room: &RoomId, peer: &PeerInfo) -> Result<RoomToken, AuthError> {
        let permitted = self
            .allowed
            .as_ref()
            .map_or(true, |rooms| rooms.contains(room));
        if !permitted {
            log::warn!("Peer {} denied access to room {room}", peer.peer_id);
            return Err(AuthError::Denied { room: room.clone() });
        }
        Ok(RoomToken::issue(room.clone(), self.secret.clone()))
    }
}
