//! Document name → running hub.
//!
//! Hubs are created lazily on first join and remove themselves after
//! eviction. A join that races with an eviction is retried against a fresh
//! hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::hub::{HubConfig, HubError, HubHandle, JoinOutcome, JoinRequest, SyncHub};
use crate::persistence::PersistenceAdapter;

pub(crate) type HubMap = Arc<RwLock<HashMap<String, HubHandle>>>;

/// Attempts before a join racing with evictions gives up.
const JOIN_ATTEMPTS: usize = 3;

pub struct HubRegistry {
    rooms: HubMap,
    config: HubConfig,
    persistence: PersistenceAdapter,
    next_generation: AtomicU64,
    closing: AtomicBool,
}

impl HubRegistry {
    pub fn new(config: HubConfig, persistence: PersistenceAdapter) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
            persistence,
            next_generation: AtomicU64::new(1),
            closing: AtomicBool::new(false),
        }
    }

    /// Get the live hub for `document`, starting one if needed.
    pub async fn get_or_create(&self, document: &str) -> Result<HubHandle, HubError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(HubError::Closed(document.to_string()));
        }

        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(hub) = rooms.get(document) {
                if !hub.is_closed() {
                    return Ok(hub.clone());
                }
            }
        }

        // Slow path: write lock, double-check
        let mut rooms = self.rooms.write().await;
        if let Some(hub) = rooms.get(document) {
            if !hub.is_closed() {
                return Ok(hub.clone());
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let hub = SyncHub::spawn(
            document,
            generation,
            self.config.clone(),
            self.persistence.clone(),
            self.rooms.clone(),
        );
        log::debug!("Started hub for {document} (generation {generation})");
        rooms.insert(document.to_string(), hub.clone());
        Ok(hub)
    }

    /// Attach a connection to `document`'s hub.
    pub async fn join(&self, document: &str, request: JoinRequest) -> Result<HubHandle, HubError> {
        let mut request = request;
        for _ in 0..JOIN_ATTEMPTS {
            let hub = self.get_or_create(document).await?;
            match hub.join(request).await {
                JoinOutcome::Joined => return Ok(hub),
                JoinOutcome::Failed(err) => return Err(err),
                JoinOutcome::Retry(bounced) => {
                    log::debug!("Hub for {document} was closing, retrying join");
                    self.forget(&hub).await;
                    request = bounced;
                }
            }
        }
        Err(HubError::Closed(document.to_string()))
    }

    /// The running hub for `document`, if any.
    pub async fn get(&self, document: &str) -> Option<HubHandle> {
        self.rooms.read().await.get(document).filter(|h| !h.is_closed()).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Flush and stop every hub. New joins are refused afterwards.
    pub async fn shutdown_all(&self) {
        self.closing.store(true, Ordering::Release);
        let hubs: Vec<HubHandle> = self.rooms.read().await.values().cloned().collect();
        for hub in hubs {
            hub.shutdown().await;
        }
        self.rooms.write().await.clear();
    }

    async fn forget(&self, hub: &HubHandle) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(hub.document()).is_some_and(|h| h.generation() == hub.generation()) {
            rooms.remove(hub.document());
        }
    }
}
