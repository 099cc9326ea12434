//! In-memory snapshot backend, for tests and ephemeral servers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::persistence::{PersistenceError, SnapshotBackend};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    puts: AtomicU64,
    gets: AtomicU64,
    fail_gets: AtomicU32,
    fail_puts: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful `put` calls so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// `get` calls so far, failed ones included.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Make the next `n` gets fail.
    pub fn fail_next_gets(&self, n: u32) {
        self.fail_gets.store(n, Ordering::Relaxed);
    }

    /// Make the next `n` puts fail.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::Relaxed);
    }

    pub async fn contains(&self, document: &str) -> bool {
        self.blobs.read().await.contains_key(document)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SnapshotBackend for MemoryBackend {
    async fn get(&self, document: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if Self::take_failure(&self.fail_gets) {
            return Err(PersistenceError::Backend("injected get failure".into()));
        }
        Ok(self.blobs.read().await.get(document).cloned())
    }

    async fn put(&self, document: &str, blob: Vec<u8>) -> Result<(), PersistenceError> {
        if Self::take_failure(&self.fail_puts) {
            return Err(PersistenceError::Backend("injected put failure".into()));
        }
        self.blobs.write().await.insert(document.to_string(), blob);
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
