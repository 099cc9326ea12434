//! # scribble-collab
//!
//! Real-time collaboration engine for Scribble boards.
//!
//! Keeps one whiteboard document consistent across every browser that has
//! it open. Presence and per-user undo ride on the same connection, and the
//! board is written back to storage in debounced batches.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄────────────────► │ SyncServer   │
//! │ (per user)   │    bincode frames  │ (gateway)    │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │ HubRegistry
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ Replicated   │                    │ SyncHub      │ one task per board
//! │ Document     │                    │ (authority)  │
//! │ + UndoManager│                    └──┬────────┬──┘
//! └──────────────┘                       │        │
//!                                ┌───────┴──┐ ┌───┴──────────────┐
//!                                │ PeerSet  │ │ PersistenceAdapter│
//!                                │ (fan-out)│ │ (debounced)       │
//!                                └──────────┘ └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`element`]: Shapes, styles and element ids
//! - [`document`]: Replicated document with last-writer-wins merge
//! - [`undo`]: Per-user undo/redo with capture window
//! - [`awareness`]: Ephemeral presence (cursors, profiles)
//! - [`protocol`]: Binary wire protocol (bincode-encoded messages)
//! - [`broadcast`]: Per-room fan-out with backpressure
//! - [`hub`]: Per-document actor owning state, fan-out and persistence
//! - [`registry`]: Document name → running hub
//! - [`persistence`]: Snapshot storage (RocksDB, in-memory) and debounce
//! - [`auth`]: Token verification for the handshake
//! - [`server`]: WebSocket gateway
//! - [`client`]: WebSocket client with local replica and offline queue

pub mod auth;
pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod document;
pub mod element;
pub mod error;
pub mod hub;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod undo;

// Re-exports for convenience
pub use auth::{AllowAnonymous, AuthError, Claims, Identity, JwtVerifier, TokenVerifier};
pub use awareness::{
    AwarenessChannel, AwarenessEntry, AwarenessEvent, AwarenessFields, CursorColor, CursorThrottle,
    UserProfile,
};
pub use broadcast::{BroadcastStats, PeerSet};
pub use client::{ClientConfig, ClientEvent, CollabClient, ConnectionState, LocalReplica, OfflineQueue};
pub use document::{
    AppliedTransaction, Change, Document, DocumentEvent, GroupToken, Operation, Origin,
    ReplicatedDocument, Stamp, Transaction,
};
pub use element::{Element, ElementId, PolygonKind, Shape, ShapeKind, Style, Vec2};
pub use error::{InvalidOperation, SyncError};
pub use hub::{HubConfig, HubError, HubHandle, HubStats};
pub use persistence::{
    DebouncePolicy, MemoryBackend, PersistenceAdapter, PersistenceError, RocksBackend,
    SnapshotBackend, StoreConfig,
};
pub use protocol::{ClientId, ClientMessage, CloseReason, ProtocolError, ServerMessage};
pub use registry::HubRegistry;
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use undo::{UndoConfig, UndoManager};
