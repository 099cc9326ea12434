//! Snapshot blob format.
//!
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ version │ lz4( bincode(Document) ), size prepended      │
//! │ 1 byte  │ variable                                     │
//! └─────────┴──────────────────────────────────────────────┘
//! ```

use crate::document::Document;
use crate::persistence::PersistenceError;

pub const FORMAT_VERSION: u8 = 1;

pub fn encode_document(doc: &Document) -> Result<Vec<u8>, PersistenceError> {
    let raw = bincode::serde::encode_to_vec(doc, bincode::config::standard())
        .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&raw);

    let mut blob = Vec::with_capacity(compressed.len() + 1);
    blob.push(FORMAT_VERSION);
    blob.extend_from_slice(&compressed);
    Ok(blob)
}

pub fn decode_document(name: &str, blob: &[u8]) -> Result<Document, PersistenceError> {
    let corrupt = |reason: String| PersistenceError::Corrupt { document: name.to_string(), reason };

    let (&version, body) = blob.split_first().ok_or_else(|| corrupt("empty blob".into()))?;
    if version != FORMAT_VERSION {
        return Err(PersistenceError::UnsupportedFormat(version));
    }
    let raw = lz4_flex::decompress_size_prepended(body).map_err(|e| corrupt(e.to_string()))?;
    let (doc, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| corrupt(e.to_string()))?;
    Ok(doc)
}
