//! Durable snapshots of documents.
//!
//! ```text
//! ┌─────────────┐  mark_dirty   ┌────────────┐  deadline   ┌────────────────────┐
//! │  SyncHub    │ ────────────► │ Debouncer  │ ──────────► │ PersistenceAdapter │
//! │ (in memory) │               └────────────┘             │  encode (codec)    │
//! └──────┬──────┘                                          └─────────┬──────────┘
//!        │ fetch on first join                                       │ store
//!        ▼                                                           ▼
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │ SnapshotBackend: RocksBackend (CF "documents" + CF "metadata") | Memory     │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A document is stored as one opaque blob keyed by its name. Only the latest
//! snapshot is kept; there is no history.

pub mod codec;
pub mod debounce;
pub mod memory;
pub mod rocks;

pub use debounce::{DebouncePolicy, Debouncer};
pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, SnapshotMetadata, StoreConfig};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::document::Document;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PersistenceError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("snapshot of {document} is corrupt: {reason}")]
    Corrupt { document: String, reason: String },
    #[error("unsupported snapshot format version {0}")]
    UnsupportedFormat(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage task failed: {0}")]
    TaskFailed(String),
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Backend(e.to_string())
    }
}

/// Blob store keyed by document name.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// The stored blob, or `None` for a document never stored.
    async fn get(&self, document: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Replace the stored blob.
    async fn put(&self, document: &str, blob: Vec<u8>) -> Result<(), PersistenceError>;
}

/// Typed front of a [`SnapshotBackend`]: documents in, documents out.
#[derive(Clone)]
pub struct PersistenceAdapter {
    backend: Arc<dyn SnapshotBackend>,
}

impl PersistenceAdapter {
    pub fn new(backend: Arc<dyn SnapshotBackend>) -> Self {
        Self { backend }
    }

    /// Adapter over a fresh [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Load the last stored snapshot. `Ok(None)` means a brand new document.
    pub async fn fetch(&self, document: &str) -> Result<Option<Document>, PersistenceError> {
        match self.backend.get(document).await? {
            Some(blob) => codec::decode_document(document, &blob).map(Some),
            None => Ok(None),
        }
    }

    /// Store a snapshot, returning the encoded size in bytes.
    pub async fn store(&self, document: &str, snapshot: &Document) -> Result<usize, PersistenceError> {
        let blob = codec::encode_document(snapshot)?;
        let size = blob.len();
        self.backend.put(document, blob).await?;
        Ok(size)
    }
}
