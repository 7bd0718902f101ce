//! # scribe-collab: real-time collaboration for scribe notes
//!
//! Connects an editor to a shared room: CRDT document sync, presence, first
//! content seeding and remote cursor rendering.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  EditorOp   ┌──────────────┐  SyncMessage  ┌─────────────┐
//! │ EditorBinding│ ──────────► │ProviderAdapter│ ◄───────────► │ RoomRelay   │
//! │ (per editor) │ ◄── changes │ (RoomHandle) │   transport   │ (per server)│
//! └──────┬───────┘             └──────┬───────┘               └──────┬──────┘
//!        │                            │                              │
//!        ▼                            ▼                              ▼
//! ┌──────────────┐             ┌──────────────┐               ┌─────────────┐
//! │ CursorOverlay│ ◄── watch ─ │ Awareness    │               │BroadcastGroup│
//! │ (per peer    │             │ Registry     │               │ (fan-out)   │
//! │  frame loop) │             └──────────────┘               └─────────────┘
//! └──────────────┘
//!        SeedingController: at-most-once initial content per room instance
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`transport`]: In-process and WebSocket transports
//! - [`relay`], [`broadcast`], [`server`]: Room relay and its WebSocket front
//! - [`provider`]: Connection lifecycle and the shared [`RoomHandle`]
//! - [`awareness`]: Presence registry
//! - [`seeding`]: Initial content injection
//! - [`binding`]: Editor ⇄ shared document
//! - [`overlay`], [`surface`]: Remote cursor projection and painting
//! - [`room`]: Authorized join/leave of a whole room session

pub mod auth;
pub mod awareness;
pub mod binding;
pub mod broadcast;
pub mod config;
pub mod overlay;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod room;
pub mod seeding;
pub mod server;
pub mod surface;
pub mod transport;

// Re-exports for convenience
pub use auth::{AuthError, RoomAuthorizer, RoomToken, StaticAuthorizer};
pub use awareness::{AwarenessMessage, AwarenessRegistry, CursorColor, PresenceEntry};
pub use binding::{EditorBinding, EditorEngine, EditorOp, MarkdownEngine};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use config::CollabConfig;
pub use overlay::{
    project_selection, CursorOverlay, CursorProjection, CursorSink, EditorSurface,
    FrameScheduler, OverlayCanvas, Rect, ResolveError, ScrollContainer, TickFrames,
};
pub use protocol::{MessageType, PeerInfo, ProtocolError, RoomId, SyncMessage};
pub use provider::{
    ConnectionIndicator, ConnectionState, ListenerId, ProviderAdapter, ProviderEvent,
    ProviderEventKind, ProviderStatus, RoomHandle,
};
pub use relay::{RelaySession, RoomRelay};
pub use room::{RoomError, RoomOptions, RoomSession};
pub use seeding::{SeedGuard, SeedOutcome, SeedingController};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use surface::{GridMetrics, TextGridSurface};
pub use transport::{
    ConnectRequest, LocalTransport, RealtimeTransport, TransportEvent, TransportLink,
    WebSocketTransport,
};
