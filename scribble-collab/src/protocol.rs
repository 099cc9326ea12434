//! Binary wire protocol between clients and the sync server.
//!
//! Every websocket binary frame carries exactly one bincode-encoded message.
//!
//! ```text
//! client                                   server
//!   │── Hello { document, token, user } ──►│  verify token, join hub
//!   │◄── Welcome { client_id, document, ───│
//!   │             awareness }              │
//!   │── Transaction ──────────────────────►│  apply, rebroadcast to others
//!   │◄───────────────────── Transaction ───│  (edits of other clients)
//!   │◄──────── Rejected { stamp, reason } ─│  (only to the sender)
//!   │── Awareness(fields) ────────────────►│
//!   │◄──────────── Awareness(event) ───────│
//!   │── Ping ─────────────────────────────►│
//!   │◄──────────────────────────── Pong ───│
//! ```
//!
//! A connection is closed with one of the [`CloseReason`] codes when the
//! session cannot continue.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::awareness::{AwarenessEntry, AwarenessEvent, AwarenessFields, UserProfile};
use crate::document::{Document, Stamp, Transaction};

/// Server-assigned id of one connection.
pub type ClientId = Uuid;

/// Largest frame either side accepts (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Longest accepted document name, in characters.
pub const MAX_DOCUMENT_NAME_LEN: usize = 128;

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First frame of every session.
    Hello {
        document: String,
        token: String,
        user: UserProfile,
    },
    Transaction(Transaction),
    Awareness(AwarenessFields),
    Ping,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Reply to `Hello`: the full current state.
    Welcome {
        client_id: ClientId,
        document: Document,
        awareness: Vec<AwarenessEntry>,
    },
    Transaction(Transaction),
    Awareness(AwarenessEvent),
    /// The sender's transaction was not applied. `stamp` is absent when the
    /// frame could not be decoded at all.
    Rejected { stamp: Option<Stamp>, reason: String },
    Pong,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Transaction(_) => "transaction",
            ServerMessage::Awareness(_) => "awareness",
            ServerMessage::Rejected { .. } => "rejected",
            ServerMessage::Pong => "pong",
        }
    }
}

fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let bytes = bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { size: bytes.len(), max: MAX_FRAME_SIZE });
    }
    Ok(bytes)
}

fn decode_frame<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { size: bytes.len(), max: MAX_FRAME_SIZE });
    }
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

/// Check a document name from a `Hello`.
pub fn validate_document_name(name: &str) -> Result<(), ProtocolError> {
    let len = name.chars().count();
    if len == 0 || len > MAX_DOCUMENT_NAME_LEN || name.chars().any(char::is_control) {
        return Err(ProtocolError::InvalidDocumentName(name.chars().take(32).collect()));
    }
    Ok(())
}

/// Why the server ended a session, mapped to websocket close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer said goodbye or the server is shutting down cleanly.
    Normal,
    Unauthorized,
    HandshakeTimeout,
    /// Outbound queue overflowed.
    Backpressure,
    /// The document could not be loaded.
    HubUnavailable,
    ProtocolViolation,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::ProtocolViolation => 1002,
            CloseReason::HubUnavailable => 1011,
            CloseReason::Unauthorized => 4401,
            CloseReason::HandshakeTimeout => 4408,
            CloseReason::Backpressure => 4429,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1000 => Some(CloseReason::Normal),
            1002 => Some(CloseReason::ProtocolViolation),
            1011 => Some(CloseReason::HubUnavailable),
            4401 => Some(CloseReason::Unauthorized),
            4408 => Some(CloseReason::HandshakeTimeout),
            4429 => Some(CloseReason::Backpressure),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal closure",
            CloseReason::Unauthorized => "unauthorized",
            CloseReason::HandshakeTimeout => "handshake timeout",
            CloseReason::Backpressure => "outbound queue overflow",
            CloseReason::HubUnavailable => "document unavailable",
            CloseReason::ProtocolViolation => "protocol violation",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("frame of {size} bytes exceeds {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("invalid document name {0:?}")]
    InvalidDocumentName(String),
    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("closed by server: {}", .0.as_str())]
    ClosedByServer(CloseReason),
    #[error("connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::CursorColor;
    use crate::document::{GroupToken, Operation, Origin, ReplicatedDocument};
    use crate::element::{Element, Shape, Style, Vec2};

    #[test]
    fn test_hello_roundtrip() {
        let msg = ClientMessage::Hello {
            document: "AB12CD".into(),
            token: "t".into(),
            user: UserProfile::new("alice", CursorColor::default()),
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_welcome_carries_document() {
        let mut doc = ReplicatedDocument::new(Uuid::new_v4());
        let el = Element::new(
            Shape::Text { origin: Vec2::new(1.0, 2.0), content: "hello".into(), font_size: 18.0 },
            Style::default(),
        );
        let tx = doc.transaction(Origin::Local, GroupToken(1), vec![Operation::insert(el.clone())]);
        doc.apply(tx).unwrap();

        let msg = ServerMessage::Welcome {
            client_id: Uuid::new_v4(),
            document: doc.snapshot(),
            awareness: vec![],
        };
        match ServerMessage::decode(&msg.encode().unwrap()).unwrap() {
            ServerMessage::Welcome { document, .. } => {
                assert_eq!(document.get(&el.id), Some(&el));
                assert_eq!(document.stamp_of(&el.id), doc.document().stamp_of(&el.id));
            }
            other => panic!("expected welcome, got {}", other.kind()),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = ClientMessage::decode(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, ProtocolError::DeserializationError(_)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let bytes = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            ServerMessage::decode(&bytes),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_document_name_validation() {
        assert!(validate_document_name("AB12CD").is_ok());
        assert!(validate_document_name("").is_err());
        assert!(validate_document_name(&"x".repeat(MAX_DOCUMENT_NAME_LEN + 1)).is_err());
        assert!(validate_document_name("bad\nname").is_err());
    }

    #[test]
    fn test_close_codes_roundtrip() {
        for reason in [
            CloseReason::Normal,
            CloseReason::Unauthorized,
            CloseReason::HandshakeTimeout,
            CloseReason::Backpressure,
            CloseReason::HubUnavailable,
            CloseReason::ProtocolViolation,
        ] {
            assert_eq!(CloseReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(CloseReason::from_code(4000), None);
    }

    #[test]
    fn test_protocol_error_display() {
        assert_eq!(ProtocolError::ConnectionClosed.to_string(), "connection closed");
        assert_eq!(ProtocolError::UnexpectedMessage("welcome").to_string(), "unexpected welcome message");
    }
}
