//! One editing session in one room.
//!
//! Joining authorizes first; only a granted token can build the provider
//! adapter. After that the editor binding is attached, the adapter connects
//! and seeding runs in the background. Switching rooms is `leave` followed
//! by a fresh `join`: nothing is shared between room instances.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::{AbortHandle, JoinHandle};

use scribe_core::SharedDocument;

use crate::auth::{AuthError, RoomAuthorizer};
use crate::binding::{EditorBinding, EditorEngine};
use crate::config::CollabConfig;
use crate::overlay::{CursorOverlay, CursorSink, EditorSurface, TickFrames};
use crate::protocol::{PeerInfo, RoomId};
use crate::provider::{ProviderAdapter, RoomHandle};
use crate::seeding::{SeedOutcome, SeedingController};
use crate::transport::RealtimeTransport;

#[derive(Debug, Clone)]
pub struct RoomOptions {
    pub room: RoomId,
    pub peer: PeerInfo,
    /// Content to seed the room with if it turns out to be empty.
    pub initial_content: Option<String>,
}

impl RoomOptions {
    pub fn new(room: impl Into<RoomId>, peer: PeerInfo) -> Self {
        Self {
            room: room.into(),
            peer,
            initial_content: None,
        }
    }

    pub fn with_initial_content(mut self, content: impl Into<String>) -> Self {
        self.initial_content = Some(content.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    Unauthorized(AuthError),
    /// The authorizer granted a different room than the one requested.
    TokenMismatch { requested: RoomId, granted: RoomId },
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized(e) => write!(f, "Unauthorized: {e}"),
            Self::TokenMismatch { requested, granted } => {
                write!(f, "Requested room {requested} but token grants {granted}")
            }
        }
    }
}

impl std::error::Error for RoomError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unauthorized(e) => Some(e),
            Self::TokenMismatch { .. } => None,
        }
    }
}

impl From<AuthError> for RoomError {
    fn from(e: AuthError) -> Self {
        Self::Unauthorized(e)
    }
}

enum Seeding {
    Running(JoinHandle<SeedOutcome>),
    Finished(Option<SeedOutcome>),
}

pub struct RoomSession<T: RealtimeTransport, E: EditorEngine> {
    adapter: ProviderAdapter<T>,
    binding: Arc<EditorBinding<E>>,
    seeding: tokio::sync::Mutex<Seeding>,
    seeding_abort: Mutex<Option<AbortHandle>>,
    frame_interval: Duration,
}

impl<T: RealtimeTransport, E: EditorEngine> RoomSession<T, E> {
    /// Authorize, attach, connect and start seeding.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn join<A: RoomAuthorizer>(
        options: RoomOptions,
        authorizer: &A,
        transport: T,
        engine: Arc<E>,
        config: &CollabConfig,
    ) -> Result<Self, RoomError> {
        let RoomOptions {
            room,
            peer,
            initial_content,
        } = options;

        let token = authorizer.authorize(&room, &peer).await?;
        if token.room() != &room {
            return Err(RoomError::TokenMismatch {
                requested: room,
                granted: token.room().clone(),
            });
        }

        let adapter = ProviderAdapter::new(transport, token, peer, SharedDocument::new(), config);
        let binding = Arc::new(EditorBinding::attach(adapter.handle().clone(), engine.clone()));
        adapter.connect();

        let controller = SeedingController::new(config.seed_delay);
        let handle = adapter.handle().clone();
        let task = tokio::spawn(async move {
            controller
                .run(handle, engine.as_ref(), initial_content.as_deref())
                .await
        });
        log::info!("Joined room {room}");

        Ok(Self {
            adapter,
            binding,
            seeding_abort: Mutex::new(Some(task.abort_handle())),
            seeding: tokio::sync::Mutex::new(Seeding::Running(task)),
            frame_interval: config.frame_interval,
        })
    }

    pub fn room(&self) -> &RoomId {
        self.adapter.handle().room()
    }

    pub fn handle(&self) -> &RoomHandle {
        self.adapter.handle()
    }

    pub fn adapter(&self) -> &ProviderAdapter<T> {
        &self.adapter
    }

    pub fn binding(&self) -> &Arc<EditorBinding<E>> {
        &self.binding
    }

    /// Wait for the seeding task. `None` if it was cancelled.
    pub async fn seed_outcome(&self) -> Option<SeedOutcome> {
        let mut seeding = self.seeding.lock().await;
        if let Seeding::Running(task) = &mut *seeding {
            let outcome = task.await.ok();
            *seeding = Seeding::Finished(outcome);
        }
        match &*seeding {
            Seeding::Finished(outcome) => outcome.clone(),
            Seeding::Running(_) => None,
        }
    }

    /// Render remote cursors onto `sink`, paced by the configured frame
    /// interval.
    pub fn attach_overlay<S, K>(&self, surface: Arc<S>, sink: Arc<K>) -> CursorOverlay
    where
        S: EditorSurface + 'static,
        K: CursorSink + 'static,
    {
        CursorOverlay::start(
            self.binding.clone(),
            surface,
            sink,
            TickFrames::new(self.frame_interval),
        )
    }

    /// Destroy the room instance. Idempotent.
    pub fn leave(&self) {
        if let Some(abort) = self
            .seeding_abort
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            abort.abort();
        }
        if !self.adapter.is_destroyed() {
            log::info!("Leaving room {}", self.room());
        }
        self.adapter.destroy();
    }
}

impl<T: RealtimeTransport, E: EditorEngine> Drop for RoomSession<T, E> {
    fn drop(&mut self) {
        self.leave();
    }
}
