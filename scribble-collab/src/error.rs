//! Error taxonomy shared by the document, hub, gateway and client layers.

use thiserror::Error;

use crate::auth::AuthError;
use crate::element::{ElementId, ShapeKind};
use crate::hub::HubError;
use crate::persistence::PersistenceError;
use crate::protocol::{ClientId, ProtocolError};

/// A transaction (or one of its operations) failed validation.
///
/// Validation runs before anything is applied, so a transaction carrying
/// any of these leaves the document untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidOperation {
    #[error("transaction carries no operations")]
    EmptyTransaction,

    #[error("operation is missing an element id")]
    MissingId,

    #[error("operation targets {op} but carries element {element}")]
    IdMismatch { op: ElementId, element: ElementId },

    #[error("{kind} element {id} has non-finite geometry")]
    NonFiniteGeometry { id: ElementId, kind: ShapeKind },

    #[error("{kind} element {id} has a negative extent")]
    NegativeExtent { id: ElementId, kind: ShapeKind },

    #[error("element {id} has invalid stroke width {width}")]
    InvalidStrokeWidth { id: ElementId, width: f32 },

    #[error("freehand element {id} has no points")]
    EmptyPath { id: ElementId },

    #[error("text element {id} has invalid font size {size}")]
    InvalidFontSize { id: ElementId, size: f32 },

    #[error("element {id} has an empty stroke color")]
    EmptyColor { id: ElementId },

    #[error("stamp clock {clock} is too far ahead of local clock {local}")]
    ClockSkew { clock: u64, local: u64 },
}

/// Top-level error for anything that can end a session.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] InvalidOperation),

    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] PersistenceError),

    #[error("peer {client_id} dropped: outbound queue overflow")]
    BackpressureDrop { client_id: ClientId },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("hub error: {0}")]
    Hub(#[from] HubError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
