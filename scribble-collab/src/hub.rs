//! Per-document sync hub.
//!
//! ## Architecture
//!
//! ```text
//!  connection tasks ──► mpsc<HubCommand> ──► SyncHub::run()  (one task per document)
//!                                                 │
//!                   ┌─────────────────────────────┼──────────────────────┐
//!                   ▼                             ▼                      ▼
//!          ReplicatedDocument             AwarenessChannel            PeerSet
//!                   │                                                    │
//!                   ▼                                                    ▼
//!          Debouncer ──► PersistenceAdapter::store (spawned)      outbound queues
//! ```
//!
//! Every mutation of a document goes through its hub task, so transactions
//! are applied and rebroadcast in one total order. Connection handlers only
//! hold a [`HubHandle`].
//!
//! Lifecycle: the hub loads the stored snapshot before serving anything
//! (commands queue up meanwhile). When the last peer leaves it waits
//! `eviction_grace`, flushes, removes itself from the registry and exits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::awareness::{AwarenessChannel, AwarenessEntry, AwarenessEvent, AwarenessFields, UserProfile};
use crate::broadcast::{AtomicBroadcastStats, BroadcastStats, Frame, PeerChannels, PeerSet};
use crate::document::{AppliedTransaction, Document, Operation, Origin, ReplicatedDocument, Transaction};
use crate::persistence::{DebouncePolicy, Debouncer, PersistenceAdapter, PersistenceError};
use crate::protocol::{ClientId, CloseReason, ProtocolError, ServerMessage};
use crate::registry::HubMap;

/// Hub tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub debounce: DebouncePolicy,
    /// How long an empty hub stays alive before eviction (default: 30s).
    pub eviction_grace: Duration,
    /// Awareness entries silent for longer are removed (default: 30s).
    pub awareness_timeout: Duration,
    /// How often idle awareness is swept (default: 5s).
    pub awareness_sweep: Duration,
    /// Command queue depth (default: 1024).
    pub command_capacity: usize,
    /// Snapshot fetch attempts before giving up (default: 3).
    pub fetch_attempts: u32,
    /// Wait between fetch attempts (default: 500ms).
    pub fetch_backoff: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            debounce: DebouncePolicy::default(),
            eviction_grace: Duration::from_secs(30),
            awareness_timeout: Duration::from_secs(30),
            awareness_sweep: Duration::from_secs(5),
            command_capacity: 1024,
            fetch_attempts: 3,
            fetch_backoff: Duration::from_millis(500),
        }
    }
}

impl HubConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            debounce: DebouncePolicy::for_testing(),
            eviction_grace: Duration::from_millis(200),
            awareness_timeout: Duration::from_secs(30),
            awareness_sweep: Duration::from_secs(1),
            command_capacity: 256,
            fetch_attempts: 2,
            fetch_backoff: Duration::from_millis(10),
        }
    }
}

/// Hub-level failures seen by callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HubError {
    #[error("hub for {0} has shut down")]
    Closed(String),
    #[error("document {document} is unavailable: {reason}")]
    Unavailable { document: String, reason: String },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Counters for one hub.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubStats {
    pub transactions_applied: u64,
    pub transactions_rejected: u64,
    pub stores_succeeded: u64,
    pub stores_failed: u64,
    pub peers: usize,
    pub elements: usize,
    pub awareness_entries: usize,
    pub dirty: bool,
}

/// Everything a connection hands over when joining.
#[derive(Debug)]
pub struct JoinRequest {
    pub client_id: ClientId,
    pub user_id: String,
    pub user: UserProfile,
    pub channels: PeerChannels,
}

pub(crate) enum JoinOutcome {
    Joined,
    /// This hub is going away; try a fresh one.
    Retry(JoinRequest),
    Failed(HubError),
}

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum HubCommand {
    Join { request: JoinRequest, reply: Reply<JoinOutcome> },
    Transaction { client_id: ClientId, transaction: Transaction },
    Awareness { client_id: ClientId, fields: AwarenessFields },
    Leave { client_id: ClientId },
    Snapshot { reply: Reply<Document> },
    AwarenessSnapshot { reply: Reply<HashMap<ClientId, AwarenessEntry>> },
    Stats { reply: Reply<HubStats> },
    Flush { reply: Reply<Result<(), HubError>> },
    Shutdown { reply: Reply<()> },
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Cheap, cloneable access to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    document: Arc<str>,
    generation: u64,
    commands: mpsc::Sender<HubCommand>,
    broadcast_stats: Arc<AtomicBroadcastStats>,
}

impl HubHandle {
    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the hub task has stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn closed(&self) -> HubError {
        HubError::Closed(self.document.to_string())
    }

    pub(crate) async fn join(&self, request: JoinRequest) -> JoinOutcome {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(cmd)) = self.commands.send(HubCommand::Join { request, reply }).await {
            return match cmd {
                HubCommand::Join { request, .. } => JoinOutcome::Retry(request),
                _ => JoinOutcome::Failed(self.closed()),
            };
        }
        rx.await.unwrap_or_else(|_| JoinOutcome::Failed(self.closed()))
    }

    /// Submit a transaction received from `client_id`.
    pub async fn submit(&self, client_id: ClientId, transaction: Transaction) -> Result<(), HubError> {
        self.send(HubCommand::Transaction { client_id, transaction }).await
    }

    pub async fn update_awareness(&self, client_id: ClientId, fields: AwarenessFields) -> Result<(), HubError> {
        self.send(HubCommand::Awareness { client_id, fields }).await
    }

    /// Detach a connection. Safe to call for peers already dropped.
    pub async fn leave(&self, client_id: ClientId) {
        let _ = self.send(HubCommand::Leave { client_id }).await;
    }

    pub async fn snapshot(&self) -> Result<Document, HubError> {
        self.request(|reply| HubCommand::Snapshot { reply }).await
    }

    pub async fn awareness_snapshot(&self) -> Result<HashMap<ClientId, AwarenessEntry>, HubError> {
        self.request(|reply| HubCommand::AwarenessSnapshot { reply }).await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|reply| HubCommand::Stats { reply }).await
    }

    /// Lock-free broadcast counters.
    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast_stats.snapshot()
    }

    /// Store the current state now if it has unsaved changes.
    pub async fn flush(&self) -> Result<(), HubError> {
        self.request(|reply| HubCommand::Flush { reply }).await?
    }

    /// Flush, close every connection and stop the hub.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| HubCommand::Shutdown { reply }).await;
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.commands.send(cmd).await.map_err(|_| self.closed())
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> HubCommand) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| self.closed())
    }
}

// ───────────────────────────────────────────────────────────────────
// Hub task
// ───────────────────────────────────────────────────────────────────

type StoreTask = JoinHandle<Result<usize, PersistenceError>>;

/// State owned by one document's task.
pub struct SyncHub {
    name: Arc<str>,
    generation: u64,
    config: HubConfig,
    doc: ReplicatedDocument,
    awareness: AwarenessChannel,
    peers: PeerSet,
    persistence: PersistenceAdapter,
    debouncer: Debouncer,
    in_flight: Option<StoreTask>,
    flush_waiters: Vec<Reply<Result<(), HubError>>>,
    /// A flush arrived while a store was running.
    flush_requested: bool,
    evict_at: Option<Instant>,
    evicting: bool,
    rooms: HubMap,
    stats: HubStats,
}

impl SyncHub {
    /// Start a hub task for `document` and return its handle.
    pub(crate) fn spawn(
        document: &str,
        generation: u64,
        config: HubConfig,
        persistence: PersistenceAdapter,
        rooms: HubMap,
    ) -> HubHandle {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let name: Arc<str> = Arc::from(document);
        let peers = PeerSet::new();
        let handle = HubHandle {
            document: name.clone(),
            generation,
            commands: tx,
            broadcast_stats: peers.stats_handle(),
        };

        let hub = SyncHub {
            name,
            generation,
            debouncer: Debouncer::new(config.debounce.clone()),
            config,
            doc: ReplicatedDocument::new(Uuid::new_v4()),
            awareness: AwarenessChannel::new(),
            peers,
            persistence,
            in_flight: None,
            flush_waiters: Vec::new(),
            flush_requested: false,
            evict_at: None,
            evicting: false,
            rooms,
            stats: HubStats::default(),
        };
        tokio::spawn(hub.run(rx));
        handle
    }

    async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>) {
        if let Err(err) = self.load().await {
            log::error!("Giving up on {}: {err}", self.name);
            self.deregister().await;
            commands.close();
            Self::refuse_pending(&mut commands, &err);
            return;
        }

        let mut sweep = tokio::time::interval(self.config.awareness_sweep);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Nobody may ever join (e.g. the first join failed upstream).
        self.schedule_eviction_if_empty();

        loop {
            if self.ready_to_evict() {
                log::info!("Evicting idle document {}", self.name);
                break;
            }

            let store_at = self.debouncer.deadline();
            let evict_at = self.evict_at;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(HubCommand::Shutdown { reply }) => {
                        self.finish().await;
                        self.deregister().await;
                        commands.close();
                        self.drain(&mut commands);
                        let _ = reply.send(());
                        log::info!("Hub for {} shut down", self.name);
                        return;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => {
                        self.finish().await;
                        return;
                    }
                },
                _ = sleep_until(store_at), if store_at.is_some() => self.begin_store(),
                result = join_store(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    let result = result.unwrap_or_else(|e| Err(PersistenceError::TaskFailed(e.to_string())));
                    self.finish_store(result);
                }
                _ = sleep_until(evict_at), if evict_at.is_some() => self.on_evict_timer(),
                _ = sweep.tick() => self.expire_idle_awareness(),
            }
        }

        self.deregister().await;
        commands.close();
        self.drain(&mut commands);
    }

    /// Fetch the stored snapshot, retrying transient failures.
    async fn load(&mut self) -> Result<(), HubError> {
        let attempts = self.config.fetch_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.persistence.fetch(&self.name).await {
                Ok(Some(doc)) => {
                    log::info!("Loaded {} ({} elements)", self.name, doc.len());
                    self.doc = ReplicatedDocument::from_document(Uuid::new_v4(), doc);
                    return Ok(());
                }
                Ok(None) => {
                    log::info!("Created new document {}", self.name);
                    return Ok(());
                }
                Err(err) => {
                    log::warn!("Fetch of {} failed (attempt {attempt}/{attempts}): {err}", self.name);
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.fetch_backoff).await;
                    }
                }
            }
        }

        Err(HubError::Unavailable {
            document: self.name.to_string(),
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Join { request, reply } => {
                let outcome = self.on_join(request);
                let _ = reply.send(outcome);
            }
            HubCommand::Transaction { client_id, transaction } => self.on_transaction(client_id, transaction),
            HubCommand::Awareness { client_id, fields } => self.on_awareness(client_id, fields),
            HubCommand::Leave { client_id } => self.on_leave(client_id),
            HubCommand::Snapshot { reply } => {
                let _ = reply.send(self.doc.snapshot());
            }
            HubCommand::AwarenessSnapshot { reply } => {
                let _ = reply.send(self.awareness.snapshot());
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.current_stats());
            }
            HubCommand::Flush { reply } => self.on_flush(reply),
            // Intercepted by run().
            HubCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // ─── Peers ────────────────────────────────────────────────────────

    fn on_join(&mut self, request: JoinRequest) -> JoinOutcome {
        let JoinRequest { client_id, user_id, user, channels } = request;
        self.evict_at = None;
        self.evicting = false;

        self.peers.add(client_id, user_id.clone(), user.clone(), channels);
        let entry = self.awareness.register(client_id, Some(user_id), user);

        let welcome = ServerMessage::Welcome {
            client_id,
            document: self.doc.snapshot(),
            awareness: self.awareness.entries(),
        };
        if let Err(err) = self.send_to(client_id, &welcome) {
            self.peers.remove(&client_id);
            self.awareness.remove(&client_id);
            self.schedule_eviction_if_empty();
            return JoinOutcome::Failed(err.into());
        }

        self.broadcast(&ServerMessage::Awareness(AwarenessEvent::Updated(entry)), Some(client_id));
        log::info!("{client_id} joined {} ({} peers)", self.name, self.peers.len());
        JoinOutcome::Joined
    }

    fn on_leave(&mut self, client_id: ClientId) {
        if self.peers.remove(&client_id) {
            log::info!("{client_id} left {} ({} peers)", self.name, self.peers.len());
        }
        self.forget_presence(client_id);
        self.schedule_eviction_if_empty();
    }

    /// Clean up after peers the broadcast layer dropped.
    fn on_dropped(&mut self, dropped: Vec<ClientId>) {
        for client_id in dropped {
            self.forget_presence(client_id);
        }
        self.schedule_eviction_if_empty();
    }

    fn forget_presence(&mut self, client_id: ClientId) {
        if self.awareness.remove(&client_id).is_some() {
            self.broadcast(&ServerMessage::Awareness(AwarenessEvent::Removed { client_id }), None);
        }
    }

    // ─── Document ─────────────────────────────────────────────────────

    fn on_transaction(&mut self, client_id: ClientId, transaction: Transaction) {
        if !self.peers.contains(&client_id) {
            log::debug!("Ignoring transaction from detached peer {client_id}");
            return;
        }

        let stamp = transaction.stamp;
        match self.doc.apply(transaction.with_origin(Origin::Remote)) {
            Ok(applied) => {
                self.stats.transactions_applied += 1;
                if applied.is_noop() {
                    return;
                }
                self.debouncer.mark_dirty(Instant::now());
                // An update that brought back a deleted element: the sender may
                // already have applied that delete, so it gets the echo too.
                let except = if resurrects(&applied) { None } else { Some(client_id) };
                self.broadcast(&ServerMessage::Transaction(applied.transaction), except);
            }
            Err(err) => {
                self.stats.transactions_rejected += 1;
                log::debug!("Rejected transaction {stamp:?} from {client_id}: {err}");
                let rejected = ServerMessage::Rejected { stamp: Some(stamp), reason: err.to_string() };
                let _ = self.send_to(client_id, &rejected);
            }
        }
    }

    // ─── Awareness ────────────────────────────────────────────────────

    fn on_awareness(&mut self, client_id: ClientId, fields: AwarenessFields) {
        if !self.peers.contains(&client_id) {
            return;
        }

        if !self.awareness.contains(&client_id) {
            // Expired while idle; bring it back with the join-time profile.
            let user_id = self.peers.user_id(&client_id).map(str::to_owned);
            let profile = self
                .peers
                .profile(&client_id)
                .cloned()
                .unwrap_or_else(|| UserProfile::guest(client_id));
            let entry = self.awareness.register(client_id, user_id, profile);
            if fields.is_empty() {
                self.broadcast(&ServerMessage::Awareness(AwarenessEvent::Updated(entry)), Some(client_id));
                return;
            }
        }

        let renew_only = fields.is_empty();
        let entry = self.awareness.set_local(client_id, fields);
        if !renew_only {
            self.broadcast(&ServerMessage::Awareness(AwarenessEvent::Updated(entry)), Some(client_id));
        }
    }

    fn expire_idle_awareness(&mut self) {
        let expired = self.awareness.expire_idle(Instant::now(), self.config.awareness_timeout);
        for client_id in expired {
            log::debug!("Awareness of {client_id} in {} expired", self.name);
            self.broadcast(&ServerMessage::Awareness(AwarenessEvent::Removed { client_id }), None);
        }
    }

    // ─── Fan-out ──────────────────────────────────────────────────────

    fn encode(&self, msg: &ServerMessage) -> Result<Frame, ProtocolError> {
        msg.encode().map(Arc::new).map_err(|err| {
            log::error!("Failed to encode {} for {}: {err}", msg.kind(), self.name);
            err
        })
    }

    fn broadcast(&mut self, msg: &ServerMessage, except: Option<ClientId>) {
        let Ok(frame) = self.encode(msg) else {
            return;
        };
        let dropped = self.peers.broadcast(frame, except);
        if !dropped.is_empty() {
            self.on_dropped(dropped);
        }
    }

    fn send_to(&mut self, client_id: ClientId, msg: &ServerMessage) -> Result<(), ProtocolError> {
        let frame = self.encode(msg)?;
        let dropped = self.peers.send_to(&client_id, frame);
        if !dropped.is_empty() {
            self.on_dropped(dropped);
        }
        Ok(())
    }

    // ─── Persistence ──────────────────────────────────────────────────

    fn begin_store(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let snapshot = self.doc.snapshot();
        self.debouncer.begin_flush(Instant::now());

        let adapter = self.persistence.clone();
        let name = self.name.clone();
        self.in_flight = Some(tokio::spawn(async move { adapter.store(&name, &snapshot).await }));
    }

    fn finish_store(&mut self, result: Result<usize, PersistenceError>) {
        self.debouncer.finish_flush(Instant::now(), result.is_ok());
        match &result {
            Ok(bytes) => {
                self.stats.stores_succeeded += 1;
                log::info!("Stored {} ({bytes} bytes, {} elements)", self.name, self.doc.document().len());
            }
            Err(err) => {
                self.stats.stores_failed += 1;
                log::warn!(
                    "Store of {} failed ({} in a row), keeping it dirty: {err}",
                    self.name,
                    self.debouncer.failures()
                );
            }
        }

        if self.flush_requested && result.is_ok() && self.debouncer.is_dirty() {
            // Changes landed while the store ran; the waiters need those too.
            self.flush_requested = false;
            self.begin_store();
            return;
        }
        self.flush_requested = false;

        let outcome = result.map(|_| ()).map_err(HubError::from);
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn on_flush(&mut self, reply: Reply<Result<(), HubError>>) {
        if self.in_flight.is_some() {
            self.flush_requested = true;
            self.flush_waiters.push(reply);
        } else if self.debouncer.is_dirty() {
            self.flush_waiters.push(reply);
            self.begin_store();
        } else {
            let _ = reply.send(Ok(()));
        }
    }

    /// Final store before the task exits. Closes every connection.
    async fn finish(&mut self) {
        self.flush_requested = false;
        if let Some(task) = self.in_flight.take() {
            let result = task
                .await
                .unwrap_or_else(|e| Err(PersistenceError::TaskFailed(e.to_string())));
            self.finish_store(result);
        }
        if self.debouncer.is_dirty() {
            let snapshot = self.doc.snapshot();
            self.debouncer.begin_flush(Instant::now());
            let result = self.persistence.store(&self.name, &snapshot).await;
            if let Err(err) = &result {
                log::error!("Final store of {} failed, changes since the last store are lost: {err}", self.name);
            }
            self.finish_store(result);
        }
        self.peers.close_all(CloseReason::Normal);
    }

    // ─── Eviction ─────────────────────────────────────────────────────

    fn schedule_eviction_if_empty(&mut self) {
        if self.peers.is_empty() && self.evict_at.is_none() && !self.evicting {
            self.evict_at = Some(Instant::now() + self.config.eviction_grace);
            log::debug!("{} is empty, evicting in {:?}", self.name, self.config.eviction_grace);
        }
    }

    fn on_evict_timer(&mut self) {
        self.evict_at = None;
        if !self.peers.is_empty() {
            return;
        }
        self.evicting = true;
        if self.debouncer.is_dirty() && self.in_flight.is_none() {
            self.begin_store();
        }
    }

    fn ready_to_evict(&self) -> bool {
        self.evicting && self.peers.is_empty() && self.in_flight.is_none() && !self.debouncer.is_dirty()
    }

    async fn deregister(&self) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(&*self.name).is_some_and(|h| h.generation() == self.generation) {
            rooms.remove(&*self.name);
        }
    }

    /// Answer commands that raced with the exit. Joins are bounced back so
    /// the registry can start a fresh hub.
    fn drain(&self, commands: &mut mpsc::Receiver<HubCommand>) {
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                HubCommand::Join { request, reply } => {
                    let _ = reply.send(JoinOutcome::Retry(request));
                }
                HubCommand::Snapshot { reply } => {
                    let _ = reply.send(self.doc.snapshot());
                }
                HubCommand::AwarenessSnapshot { reply } => {
                    let _ = reply.send(HashMap::new());
                }
                HubCommand::Stats { reply } => {
                    let _ = reply.send(self.current_stats());
                }
                HubCommand::Flush { reply } => {
                    let _ = reply.send(Ok(()));
                }
                HubCommand::Shutdown { reply } => {
                    let _ = reply.send(());
                }
                HubCommand::Transaction { client_id, .. } | HubCommand::Awareness { client_id, .. } => {
                    log::debug!("Dropping late message from {client_id} to closed hub {}", self.name);
                }
                HubCommand::Leave { .. } => {}
            }
        }
    }

    /// Fail everything queued while the initial load was retrying.
    fn refuse_pending(commands: &mut mpsc::Receiver<HubCommand>, err: &HubError) {
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                HubCommand::Join { reply, .. } => {
                    let _ = reply.send(JoinOutcome::Failed(err.clone()));
                }
                HubCommand::Flush { reply } => {
                    let _ = reply.send(Err(err.clone()));
                }
                HubCommand::Shutdown { reply } => {
                    let _ = reply.send(());
                }
                _ => {}
            }
        }
    }

    fn current_stats(&self) -> HubStats {
        HubStats {
            peers: self.peers.len(),
            elements: self.doc.document().len(),
            awareness_entries: self.awareness.len(),
            dirty: self.debouncer.is_dirty() || self.in_flight.is_some(),
            ..self.stats.clone()
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn join_store(task: &mut Option<StoreTask>) -> Result<Result<usize, PersistenceError>, tokio::task::JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn resurrects(applied: &AppliedTransaction) -> bool {
    applied.changes.iter().any(|change| {
        change.before.is_none()
            && applied
                .transaction
                .ops
                .iter()
                .any(|op| matches!(op, Operation::Update { id, .. } if *id == change.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::CursorColor;
    use crate::document::GroupToken;
    use crate::element::{Element, Shape, Style, Vec2};
    use crate::persistence::MemoryBackend;
    use tokio::sync::RwLock;

    struct TestPeer {
        id: ClientId,
        rx: mpsc::Receiver<Frame>,
        close: oneshot::Receiver<CloseReason>,
    }

    impl TestPeer {
        async fn next(&mut self) -> ServerMessage {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("hub dropped the peer");
            ServerMessage::decode(&frame).unwrap()
        }
    }

    fn spawn_hub(backend: Arc<MemoryBackend>) -> HubHandle {
        SyncHub::spawn(
            "ROOM01",
            1,
            HubConfig::for_testing(),
            PersistenceAdapter::new(backend),
            Arc::new(RwLock::new(HashMap::new())),
        )
    }

    async fn join(hub: &HubHandle, name: &str, capacity: usize) -> TestPeer {
        let (channels, rx, close) = PeerChannels::new(capacity);
        let id = Uuid::new_v4();
        let request = JoinRequest {
            client_id: id,
            user_id: name.to_string(),
            user: UserProfile::new(name, CursorColor::default()),
            channels,
        };
        assert!(matches!(hub.join(request).await, JoinOutcome::Joined));
        TestPeer { id, rx, close }
    }

    fn insert(replica: &mut ReplicatedDocument, x: f32) -> (Element, Transaction) {
        let el = Element::new(
            Shape::Rectangle { origin: Vec2::new(x, x), width: 50.0, height: 50.0 },
            Style::default(),
        );
        let tx = replica.transaction(Origin::Local, GroupToken(1), vec![Operation::insert(el.clone())]);
        (el, tx)
    }

    #[tokio::test]
    async fn test_join_receives_welcome_and_others_see_presence() {
        let hub = spawn_hub(Arc::new(MemoryBackend::new()));
        let mut a = join(&hub, "alice", 16).await;
        match a.next().await {
            ServerMessage::Welcome { client_id, document, awareness } => {
                assert_eq!(client_id, a.id);
                assert!(document.is_empty());
                assert_eq!(awareness.len(), 1);
            }
            other => panic!("expected welcome, got {}", other.kind()),
        }

        let mut b = join(&hub, "bob", 16).await;
        match b.next().await {
            ServerMessage::Welcome { awareness, .. } => assert_eq!(awareness.len(), 2),
            other => panic!("expected welcome, got {}", other.kind()),
        }
        match a.next().await {
            ServerMessage::Awareness(AwarenessEvent::Updated(entry)) => {
                assert_eq!(entry.client_id, b.id);
                assert_eq!(entry.user_id.as_deref(), Some("bob"));
            }
            other => panic!("expected awareness, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_transaction_is_rebroadcast_to_others_only() {
        let hub = spawn_hub(Arc::new(MemoryBackend::new()));
        let mut a = join(&hub, "alice", 16).await;
        let mut b = join(&hub, "bob", 16).await;
        a.next().await; // welcome
        a.next().await; // bob joined
        b.next().await; // welcome

        let mut replica = ReplicatedDocument::new(Uuid::new_v4());
        let (el, tx) = insert(&mut replica, 10.0);
        hub.submit(a.id, tx.clone()).await.unwrap();

        match b.next().await {
            ServerMessage::Transaction(received) => {
                assert_eq!(received.stamp, tx.stamp);
                assert_eq!(received.origin, Origin::Remote);
            }
            other => panic!("expected transaction, got {}", other.kind()),
        }
        let snapshot = hub.snapshot().await.unwrap();
        assert_eq!(snapshot.get(&el.id), Some(&el));
        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_transaction_rejected_to_sender() {
        let hub = spawn_hub(Arc::new(MemoryBackend::new()));
        let mut a = join(&hub, "alice", 16).await;
        let mut b = join(&hub, "bob", 16).await;
        a.next().await;
        a.next().await;
        b.next().await;

        let mut replica = ReplicatedDocument::new(Uuid::new_v4());
        let tx = replica.transaction(Origin::Local, GroupToken(1), vec![]);
        hub.submit(a.id, tx.clone()).await.unwrap();

        match a.next().await {
            ServerMessage::Rejected { stamp, .. } => assert_eq!(stamp, Some(tx.stamp)),
            other => panic!("expected rejection, got {}", other.kind()),
        }
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.transactions_rejected, 1);
        assert_eq!(stats.elements, 0);
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_transaction_not_rebroadcast() {
        let hub = spawn_hub(Arc::new(MemoryBackend::new()));
        let mut a = join(&hub, "alice", 16).await;
        let mut b = join(&hub, "bob", 16).await;
        a.next().await;
        a.next().await;
        b.next().await;

        let mut replica = ReplicatedDocument::new(Uuid::new_v4());
        let (_, tx) = insert(&mut replica, 1.0);
        hub.submit(a.id, tx.clone()).await.unwrap();
        hub.submit(a.id, tx).await.unwrap();

        assert!(matches!(b.next().await, ServerMessage::Transaction(_)));
        hub.stats().await.unwrap();
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_after_delete_is_echoed_to_sender() {
        let hub = spawn_hub(Arc::new(MemoryBackend::new()));
        let mut a = join(&hub, "alice", 16).await;
        let mut b = join(&hub, "bob", 16).await;
        a.next().await;
        a.next().await;
        b.next().await;

        let mut alice = ReplicatedDocument::new(Uuid::new_v4());
        let mut bob = ReplicatedDocument::new(Uuid::new_v4());
        let (el, tx) = insert(&mut alice, 1.0);
        alice.apply(tx.clone()).unwrap();
        hub.submit(a.id, tx).await.unwrap();
        match b.next().await {
            ServerMessage::Transaction(tx) => {
                bob.apply(tx).unwrap();
            }
            other => panic!("expected transaction, got {}", other.kind()),
        }

        // Bob moves the element while Alice deletes it; Alice's delete wins the race to the hub.
        let moved = el.translated(Vec2::new(5.0, 5.0));
        let update = bob.transaction(Origin::Local, GroupToken(2), vec![Operation::update(moved.clone())]);
        bob.apply(update.clone()).unwrap();
        let delete = alice.transaction(Origin::Local, GroupToken(2), vec![Operation::delete(el.id)]);
        alice.apply(delete.clone()).unwrap();
        hub.submit(a.id, delete).await.unwrap();
        match b.next().await {
            ServerMessage::Transaction(tx) => {
                bob.apply(tx).unwrap();
            }
            other => panic!("expected transaction, got {}", other.kind()),
        }
        assert!(bob.get(&el.id).is_none());

        hub.submit(b.id, update).await.unwrap();
        for (peer, replica) in [(&mut a, &mut alice), (&mut b, &mut bob)] {
            match peer.next().await {
                ServerMessage::Transaction(tx) => {
                    replica.apply(tx).unwrap();
                }
                other => panic!("expected transaction, got {}", other.kind()),
            }
        }

        let snapshot = hub.snapshot().await.unwrap();
        assert_eq!(snapshot.get(&el.id), Some(&moved));
        assert_eq!(alice.snapshot(), snapshot);
        assert_eq!(bob.snapshot(), snapshot);
    }

    #[tokio::test]
    async fn test_leave_broadcasts_removal() {
        let hub = spawn_hub(Arc::new(MemoryBackend::new()));
        let mut a = join(&hub, "alice", 16).await;
        let b = join(&hub, "bob", 16).await;
        a.next().await;
        a.next().await;

        hub.leave(b.id).await;
        match a.next().await {
            ServerMessage::Awareness(AwarenessEvent::Removed { client_id }) => assert_eq!(client_id, b.id),
            other => panic!("expected removal, got {}", other.kind()),
        }
        let awareness = hub.awareness_snapshot().await.unwrap();
        assert!(!awareness.contains_key(&b.id));
        assert_eq!(awareness.len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_update_reaches_others() {
        let hub = spawn_hub(Arc::new(MemoryBackend::new()));
        let mut a = join(&hub, "alice", 16).await;
        let mut b = join(&hub, "bob", 16).await;
        a.next().await;
        a.next().await;
        b.next().await;

        hub.update_awareness(b.id, AwarenessFields::cursor(Some(Vec2::new(3.0, 4.0)))).await.unwrap();
        match a.next().await {
            ServerMessage::Awareness(AwarenessEvent::Updated(entry)) => {
                assert_eq!(entry.client_id, b.id);
                assert_eq!(entry.cursor, Some(Vec2::new(3.0, 4.0)));
            }
            other => panic!("expected awareness, got {}", other.kind()),
        }

        // Heartbeats renew silently.
        hub.update_awareness(b.id, AwarenessFields::default()).await.unwrap();
        hub.stats().await.unwrap();
        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_peer_is_dropped() {
        let hub = spawn_hub(Arc::new(MemoryBackend::new()));
        let mut fast = join(&hub, "fast", 64).await;
        // Room for the welcome only.
        let slow = join(&hub, "slow", 1).await;
        fast.next().await;
        fast.next().await;

        let mut replica = ReplicatedDocument::new(Uuid::new_v4());
        let (_, tx) = insert(&mut replica, 1.0);
        hub.submit(fast.id, tx).await.unwrap();
        hub.update_awareness(fast.id, AwarenessFields::cursor(Some(Vec2::ZERO))).await.unwrap();

        assert_eq!(slow.close.await.unwrap(), CloseReason::Backpressure);
        match fast.next().await {
            ServerMessage::Awareness(AwarenessEvent::Removed { client_id }) => assert_eq!(client_id, slow.id),
            other => panic!("expected removal, got {}", other.kind()),
        }
        assert_eq!(hub.broadcast_stats().peers_dropped, 1);
        assert_eq!(hub.stats().await.unwrap().peers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_are_debounced() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = spawn_hub(backend.clone());
        let a = join(&hub, "alice", 256).await;
        let mut replica = ReplicatedDocument::new(Uuid::new_v4());

        for i in 0..5 {
            let (_, tx) = insert(&mut replica, i as f32);
            hub.submit(a.id, tx).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.put_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.put_count(), 1);
        assert!(!hub.stats().await.unwrap().dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_editing_hits_max_delay() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = spawn_hub(backend.clone());
        let a = join(&hub, "alice", 1024).await;
        let mut replica = ReplicatedDocument::new(Uuid::new_v4());

        // 30ms apart for 1.2s: the 50ms quiet period never elapses.
        for i in 0..40 {
            let (_, tx) = insert(&mut replica, i as f32);
            hub.submit(a.id, tx).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(backend.put_count(), 2);
    }

    #[tokio::test]
    async fn test_flush_stores_immediately() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = spawn_hub(backend.clone());
        let a = join(&hub, "alice", 16).await;
        let mut replica = ReplicatedDocument::new(Uuid::new_v4());
        let (_, tx) = insert(&mut replica, 1.0);
        hub.submit(a.id, tx).await.unwrap();

        hub.flush().await.unwrap();
        assert_eq!(backend.put_count(), 1);
        assert!(backend.contains("ROOM01").await);

        // Clean: nothing to do.
        hub.flush().await.unwrap();
        assert_eq!(backend.put_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_store_is_retried() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_puts(1);
        let hub = spawn_hub(backend.clone());
        let a = join(&hub, "alice", 16).await;
        let mut replica = ReplicatedDocument::new(Uuid::new_v4());
        let (el, tx) = insert(&mut replica, 1.0);
        hub.submit(a.id, tx).await.unwrap();

        assert!(matches!(hub.flush().await, Err(HubError::Persistence(_))));
        assert!(hub.stats().await.unwrap().dirty);
        // Connections never hear about it, the document is intact.
        assert_eq!(hub.snapshot().await.unwrap().get(&el.id), Some(&el));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.stores_failed, 1);
        assert_eq!(stats.stores_succeeded, 1);
        assert_eq!(backend.put_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = spawn_hub(backend.clone());
        let a = join(&hub, "alice", 16).await;
        let mut replica = ReplicatedDocument::new(Uuid::new_v4());
        let (_, tx) = insert(&mut replica, 1.0);
        hub.submit(a.id, tx).await.unwrap();

        hub.shutdown().await;
        assert_eq!(backend.put_count(), 1);
        assert_eq!(a.close.await.unwrap(), CloseReason::Normal);
        assert!(hub.is_closed());
        assert!(matches!(hub.snapshot().await, Err(HubError::Closed(_))));
    }

    #[tokio::test]
    async fn test_loads_stored_snapshot() {
        let backend = Arc::new(MemoryBackend::new());
        let adapter = PersistenceAdapter::new(backend.clone());
        let mut replica = ReplicatedDocument::new(Uuid::new_v4());
        let (el, tx) = insert(&mut replica, 7.0);
        replica.apply(tx).unwrap();
        adapter.store("ROOM01", &replica.snapshot()).await.unwrap();

        let hub = spawn_hub(backend);
        let mut a = join(&hub, "alice", 16).await;
        match a.next().await {
            ServerMessage::Welcome { document, .. } => assert_eq!(document.get(&el.id), Some(&el)),
            other => panic!("expected welcome, got {}", other.kind()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_awareness_expires() {
        let hub = spawn_hub(Arc::new(MemoryBackend::new()));
        let mut a = join(&hub, "alice", 64).await;
        let b = join(&hub, "bob", 64).await;
        a.next().await;
        a.next().await;

        // Alice keeps heartbeating, Bob goes quiet.
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            hub.update_awareness(a.id, AwarenessFields::default()).await.unwrap();
        }

        let awareness = hub.awareness_snapshot().await.unwrap();
        assert!(awareness.contains_key(&a.id));
        assert!(!awareness.contains_key(&b.id));
        match a.next().await {
            ServerMessage::Awareness(AwarenessEvent::Removed { client_id }) => assert_eq!(client_id, b.id),
            other => panic!("expected removal, got {}", other.kind()),
        }

        // Bob is still connected: his next update brings him back.
        hub.update_awareness(b.id, AwarenessFields::cursor(Some(Vec2::ZERO))).await.unwrap();
        assert!(hub.awareness_snapshot().await.unwrap().contains_key(&b.id));
    }
}
