//! WebSocket sync client: the UI-facing session.
//!
//! Provides:
//! - Connection lifecycle (connect, close, rejoin another board)
//! - A local replica the UI reads from and edits synchronously
//! - Undo/redo of this user's own edits
//! - Awareness (cursor, profile) with 30fps cursor throttling
//! - Offline queue for edits made while disconnected
//!
//! Local edits are applied to the replica first and then sent. Remote
//! transactions are applied as they arrive; the UI learns about both
//! through [`CollabClient::subscribe`].

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::awareness::{
    AwarenessChannel, AwarenessEntry, AwarenessEvent, AwarenessFields, CursorThrottle, UserProfile,
    CURSOR_INTERVAL,
};
use crate::document::{
    AppliedTransaction, Document, DocumentEvent, GroupToken, Operation, Origin, ReplicatedDocument, Stamp,
    Transaction,
};
use crate::element::{Element, ElementId, Shape, Style, Vec2};
use crate::error::SyncError;
use crate::protocol::{ClientId, ClientMessage, CloseReason, ProtocolError, ServerMessage};
use crate::undo::{UndoConfig, UndoManager};

type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Client tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Frames buffered towards the socket writer
    pub outbound_capacity: usize,
    /// Events buffered for [`CollabClient::take_event_rx`]
    pub event_capacity: usize,
    /// Transactions kept while disconnected
    pub offline_queue_capacity: usize,
    /// Liveness ping for our awareness entry (must beat the server's idle timeout)
    pub heartbeat_interval: Duration,
    /// Time allowed for the server's `Welcome`
    pub handshake_timeout: Duration,
    pub cursor_interval: Duration,
    pub undo: UndoConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            event_capacity: 256,
            offline_queue_capacity: 10_000,
            heartbeat_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
            cursor_interval: CURSOR_INTERVAL,
            undo: UndoConfig::default(),
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Session events for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { client_id: ClientId },
    /// `reason` is set when the server sent a close code we know.
    Disconnected { reason: Option<CloseReason> },
    /// The server refused one of our frames.
    Rejected { stamp: Option<Stamp>, reason: String },
    /// Somebody else's presence changed.
    Awareness(AwarenessEvent),
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

/// Offline queue for edits made while disconnected.
///
/// Queued transactions are re-stamped and replayed after the next
/// `Welcome`.
pub struct OfflineQueue {
    queue: VecDeque<QueuedTransaction>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedTransaction {
    transaction: Transaction,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a transaction for later replay. Returns false when full.
    pub fn enqueue(&mut self, transaction: Transaction) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedTransaction { transaction, queued_at: Instant::now() });
        true
    }

    /// Take every queued transaction, oldest first.
    pub fn drain(&mut self) -> Vec<Transaction> {
        if let Some(oldest) = self.queue.front() {
            log::debug!(
                "Draining {} queued transactions (oldest {:?} old)",
                self.queue.len(),
                oldest.queued_at.elapsed()
            );
        }
        self.queue.drain(..).map(|q| q.transaction).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Operations across all queued transactions.
    pub fn total_ops(&self) -> usize {
        self.queue.iter().map(|q| q.transaction.ops.len()).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Local replica
// ───────────────────────────────────────────────────────────────────

/// Everything the client keeps about the board it is editing.
pub struct LocalReplica {
    pub doc: ReplicatedDocument,
    pub undo: UndoManager,
    pub awareness: AwarenessChannel,
    throttle: CursorThrottle,
    queue: OfflineQueue,
    group: GroupToken,
    /// Board the replica's content belongs to.
    document: Option<String>,
    client_id: Option<ClientId>,
    /// Present while a session is live.
    outgoing: Option<mpsc::Sender<Message>>,
    /// Transactions handed to the connection that no `Pong` has confirmed,
    /// numbered in send order.
    unacked: VecDeque<(u64, Transaction)>,
    sent: u64,
    /// Value of `sent` when each outstanding ping went out, oldest first.
    pings: VecDeque<u64>,
}

impl LocalReplica {
    fn new(config: &ClientConfig) -> Self {
        Self {
            doc: ReplicatedDocument::new(Uuid::new_v4()),
            undo: UndoManager::new(config.undo.clone()),
            awareness: AwarenessChannel::new(),
            throttle: CursorThrottle::new(config.cursor_interval),
            queue: OfflineQueue::new(config.offline_queue_capacity),
            group: GroupToken(1),
            document: None,
            client_id: None,
            outgoing: None,
            unacked: VecDeque::new(),
            sent: 0,
            pings: VecDeque::new(),
        }
    }

    /// Apply a local edit and hand it to the connection (or the queue).
    async fn commit(&mut self, ops: Vec<Operation>) -> Result<AppliedTransaction, SyncError> {
        let tx = self.doc.transaction(Origin::Local, self.group, ops);
        let applied = self.undo.apply(&mut self.doc, tx)?;
        if !applied.is_noop() {
            self.publish(applied.transaction.clone()).await?;
        }
        Ok(applied)
    }

    async fn publish(&mut self, tx: Transaction) -> Result<(), SyncError> {
        if let Some(outgoing) = &self.outgoing {
            let frame = ClientMessage::Transaction(tx.clone()).encode()?;
            if outgoing.send(Message::Binary(frame.into())).await.is_ok() {
                self.sent += 1;
                self.unacked.push_back((self.sent, tx));
                if self.pings.is_empty() {
                    // Failure here shows up on the next send.
                    let _ = self.ping().await;
                }
                return Ok(());
            }
            self.outgoing = None;
        }
        if !self.queue.enqueue(tx) {
            log::warn!("Offline queue full, edit kept locally only");
            return Err(ProtocolError::ConnectionClosed.into());
        }
        Ok(())
    }

    /// Ask the server to confirm every transaction sent so far.
    async fn ping(&mut self) -> Result<(), SyncError> {
        let outgoing = self.outgoing.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let frame = ClientMessage::Ping.encode()?;
        outgoing
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.pings.push_back(self.sent);
        Ok(())
    }

    /// The server answers pings in order, after handing every earlier frame
    /// to the hub.
    fn on_pong(&mut self) {
        let Some(through) = self.pings.pop_front() else {
            log::trace!("Pong");
            return;
        };
        while self.unacked.front().is_some_and(|(seq, _)| *seq <= through) {
            self.unacked.pop_front();
        }
        log::trace!("Pong, {} transactions unconfirmed", self.unacked.len());
        if self.unacked.is_empty() || !self.pings.is_empty() {
            return;
        }
        let Some(outgoing) = &self.outgoing else { return };
        if let Ok(frame) = ClientMessage::Ping.encode() {
            if outgoing.try_send(Message::Binary(frame.into())).is_ok() {
                self.pings.push_back(self.sent);
            }
        }
    }

    async fn send_awareness(&mut self, fields: AwarenessFields) -> Result<(), SyncError> {
        if let Some(client_id) = self.client_id {
            self.awareness.set_local(client_id, fields.clone());
        }
        // Presence is not queued while offline.
        if let Some(outgoing) = &self.outgoing {
            let frame = ClientMessage::Awareness(fields).encode()?;
            if outgoing.send(Message::Binary(frame.into())).await.is_err() {
                self.outgoing = None;
            }
        }
        Ok(())
    }

    /// Adopt the server state from a `Welcome`, then replay edits the server
    /// may not have on top of it. Returns the frames to send.
    ///
    /// Unconfirmed transactions keep their stamps, so one the server did
    /// apply is a no-op the second time. Queued ones were never sent and are
    /// stamped afresh.
    fn welcome(
        &mut self,
        document: &str,
        client_id: ClientId,
        snapshot: Document,
        awareness: Vec<AwarenessEntry>,
    ) -> Result<Vec<Vec<u8>>, SyncError> {
        if self.document.as_deref() != Some(document) {
            if self.document.is_some() {
                log::info!("Switched to board {document}, clearing history");
            }
            self.undo.clear();
            self.queue.clear();
            self.unacked.clear();
            self.document = Some(document.to_string());
        }
        self.client_id = Some(client_id);
        self.pings.clear();
        self.doc.load_snapshot(snapshot, Origin::Remote);
        self.awareness.replace_all(awareness);

        let unconfirmed: Vec<Transaction> = self.unacked.drain(..).map(|(_, tx)| tx).collect();
        let queued = self.queue.drain();
        if !unconfirmed.is_empty() || !queued.is_empty() {
            log::info!(
                "Replaying {} unconfirmed and {} queued transactions",
                unconfirmed.len(),
                queued.len()
            );
        }

        let mut replay = Vec::with_capacity(unconfirmed.len() + queued.len());
        for tx in unconfirmed {
            replay.push(self.doc.apply(tx)?.transaction);
        }
        for tx in queued {
            let tx = Transaction::new(self.doc.next_stamp(), Origin::Local, tx.group, tx.ops);
            replay.push(self.doc.apply(tx)?.transaction);
        }

        let mut frames = Vec::with_capacity(replay.len() + 1);
        for tx in replay {
            frames.push(ClientMessage::Transaction(tx.clone()).encode()?);
            self.sent += 1;
            self.unacked.push_back((self.sent, tx));
        }
        if !frames.is_empty() {
            frames.push(ClientMessage::Ping.encode()?);
            self.pings.push_back(self.sent);
        }
        Ok(frames)
    }

    fn on_server_message(&mut self, msg: ServerMessage, events: &mpsc::Sender<ClientEvent>) {
        match msg {
            ServerMessage::Transaction(tx) => {
                if let Err(e) = self.doc.apply(tx.with_origin(Origin::Remote)) {
                    log::warn!("Dropping invalid remote transaction: {e}");
                }
            }
            ServerMessage::Awareness(event) => {
                if Some(event.client_id()) == self.client_id {
                    return;
                }
                log::trace!("Awareness event for {}", event.client_id());
                if self.awareness.apply_remote(event.clone()) {
                    emit(events, ClientEvent::Awareness(event));
                }
            }
            ServerMessage::Rejected { stamp, reason } => {
                log::warn!("Server rejected {stamp:?}: {reason}");
                emit(events, ClientEvent::Rejected { stamp, reason });
            }
            ServerMessage::Welcome { document, awareness, .. } => {
                log::debug!("Unexpected welcome mid-session, resyncing");
                self.doc.load_snapshot(document, Origin::Remote);
                self.awareness.replace_all(awareness);
            }
            ServerMessage::Pong => self.on_pong(),
        }
    }
}

fn emit(events: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if events.try_send(event).is_err() {
        log::trace!("Client event dropped: receiver full or gone");
    }
}

// ───────────────────────────────────────────────────────────────────
// Client
// ───────────────────────────────────────────────────────────────────

/// The sync client.
///
/// Manages a WebSocket session with the server, a local replica of one
/// board, the user's undo history and the offline queue.
pub struct CollabClient {
    server_url: String,
    document: String,
    token: String,
    user: UserProfile,
    config: ClientConfig,

    replica: Arc<Mutex<LocalReplica>>,
    state: Arc<RwLock<ConnectionState>>,

    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,

    tasks: Vec<JoinHandle<()>>,
}

impl CollabClient {
    pub fn new(
        server_url: impl Into<String>,
        document: impl Into<String>,
        token: impl Into<String>,
        user: UserProfile,
    ) -> Self {
        Self::with_config(server_url, document, token, user, ClientConfig::default())
    }

    pub fn with_config(
        server_url: impl Into<String>,
        document: impl Into<String>,
        token: impl Into<String>,
        user: UserProfile,
        config: ClientConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            server_url: server_url.into(),
            document: document.into(),
            token: token.into(),
            user,
            replica: Arc::new(Mutex::new(LocalReplica::new(&config))),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect, wait for the server's `Welcome` and start the session tasks.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        self.stop_tasks();
        *self.state.write().await = ConnectionState::Connecting;
        match self.open_session().await {
            Ok(client_id) => {
                log::info!("Joined {} as {client_id}", self.document);
                emit(&self.event_tx, ClientEvent::Connected { client_id });
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open_session(&mut self) -> Result<ClientId, SyncError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.server_url.as_str()).await?;
        let (mut sink, mut source) = ws_stream.split();

        let hello = ClientMessage::Hello {
            document: self.document.clone(),
            token: self.token.clone(),
            user: self.user.clone(),
        };
        sink.send(Message::Binary(hello.encode()?.into())).await?;

        let welcome = tokio::time::timeout(self.config.handshake_timeout, read_welcome(&mut source))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        let kind = welcome.kind();
        let ServerMessage::Welcome { client_id, document, awareness } = welcome else {
            return Err(ProtocolError::UnexpectedMessage(kind).into());
        };

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(self.config.outbound_capacity.max(1));
        {
            let mut replica = self.replica.lock().await;
            for frame in replica.welcome(&self.document, client_id, document, awareness)? {
                sink.send(Message::Binary(frame.into())).await?;
            }
            replica.outgoing = Some(out_tx);
            *self.state.write().await = ConnectionState::Connected;
        }

        // Writer task: outgoing frames, heartbeats and held-back cursor moves.
        let replica = self.replica.clone();
        let heartbeat_every = self.config.heartbeat_interval;
        let cursor_every = self.config.cursor_interval;
        let writer = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cursor = tokio::time::interval(cursor_every);
            cursor.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let msg = tokio::select! {
                    msg = out_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = heartbeat.tick() => match ClientMessage::Awareness(AwarenessFields::default()).encode() {
                        Ok(frame) => Message::Binary(frame.into()),
                        Err(_) => continue,
                    },
                    _ = cursor.tick() => {
                        // Busy replica: try again next tick.
                        let Ok(mut replica) = replica.try_lock() else { continue };
                        let Some(position) = replica.throttle.flush(Instant::now()) else { continue };
                        if let Some(client_id) = replica.client_id {
                            replica.awareness.set_local(client_id, AwarenessFields::cursor(position));
                        }
                        match ClientMessage::Awareness(AwarenessFields::cursor(position)).encode() {
                            Ok(frame) => Message::Binary(frame.into()),
                            Err(_) => continue,
                        }
                    }
                };
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: remote transactions and presence.
        let replica = self.replica.clone();
        let state = self.state.clone();
        let events = self.event_tx.clone();
        let reader = tokio::spawn(async move {
            let mut reason = None;
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(msg) => replica.lock().await.on_server_message(msg, &events),
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(frame)) => {
                        reason = frame.and_then(|f| CloseReason::from_code(u16::from(f.code)));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("Connection error: {e}");
                        break;
                    }
                }
            }

            replica.lock().await.outgoing = None;
            *state.write().await = ConnectionState::Disconnected;
            log::info!("Disconnected ({:?})", reason);
            emit(&events, ClientEvent::Disconnected { reason });
        });

        self.tasks = vec![writer, reader];
        Ok(client_id)
    }

    /// Close the session. Local state is kept.
    pub async fn close(&mut self) {
        let outgoing = self.replica.lock().await.outgoing.take();
        if let Some(outgoing) = outgoing {
            let _ = outgoing.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Leave the current board and join `document`. Undo history and
    /// queued edits of the old board are dropped.
    pub async fn switch_document(&mut self, document: impl Into<String>) -> Result<(), SyncError> {
        self.close().await;
        self.document = document.into();
        self.connect().await
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    // ─── Document ─────────────────────────────────────────────────────

    /// Owned copy of the board.
    pub async fn snapshot(&self) -> Document {
        self.replica.lock().await.doc.snapshot()
    }

    /// Change notifications for local, remote, undo and redo edits.
    pub async fn subscribe(&self) -> broadcast::Receiver<Arc<DocumentEvent>> {
        self.replica.lock().await.doc.subscribe()
    }

    /// Apply `ops` as one local transaction.
    pub async fn apply_local(&self, ops: Vec<Operation>) -> Result<AppliedTransaction, SyncError> {
        self.replica.lock().await.commit(ops).await
    }

    /// Add a new element and return its id.
    pub async fn insert(&self, shape: Shape, style: Style) -> Result<ElementId, SyncError> {
        let element = Element::new(shape, style);
        let id = element.id;
        self.apply_local(vec![Operation::insert(element)]).await?;
        Ok(id)
    }

    /// Replace an element wholesale.
    pub async fn update(&self, element: Element) -> Result<AppliedTransaction, SyncError> {
        self.apply_local(vec![Operation::update(element)]).await
    }

    pub async fn delete(&self, id: ElementId) -> Result<AppliedTransaction, SyncError> {
        self.apply_local(vec![Operation::delete(id)]).await
    }

    /// Modify a copy of the current element and write it back.
    /// Returns false when the element does not exist.
    pub async fn update_with(&self, id: ElementId, f: impl FnOnce(&mut Element)) -> Result<bool, SyncError> {
        let mut replica = self.replica.lock().await;
        let Some(mut element) = replica.doc.get(&id).cloned() else {
            return Ok(false);
        };
        f(&mut element);
        element.id = id;
        replica.commit(vec![Operation::update(element)]).await?;
        Ok(true)
    }

    /// End the current gesture: the next edit opens a new undo frame.
    pub async fn boundary(&self) {
        let mut replica = self.replica.lock().await;
        replica.undo.boundary();
        replica.group = GroupToken(replica.group.0 + 1);
    }

    /// Revert the last frame of this user's edits.
    pub async fn undo(&self) -> Result<bool, SyncError> {
        let mut replica = self.replica.lock().await;
        let replica = &mut *replica;
        match replica.undo.undo(&mut replica.doc)? {
            Some(applied) => {
                replica.publish(applied.transaction).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn redo(&self) -> Result<bool, SyncError> {
        let mut replica = self.replica.lock().await;
        let replica = &mut *replica;
        match replica.undo.redo(&mut replica.doc)? {
            Some(applied) => {
                replica.publish(applied.transaction).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn can_undo(&self) -> bool {
        self.replica.lock().await.undo.can_undo()
    }

    pub async fn can_redo(&self) -> bool {
        self.replica.lock().await.undo.can_redo()
    }

    // ─── Awareness ────────────────────────────────────────────────────

    /// Move our cursor (`None` = off canvas). Throttled to the cursor
    /// interval; the last held-back position is sent by the writer task.
    pub async fn set_cursor(&self, position: Option<Vec2>) -> Result<(), SyncError> {
        let mut replica = self.replica.lock().await;
        match replica.throttle.offer(position, Instant::now()) {
            Some(position) => replica.send_awareness(AwarenessFields::cursor(position)).await,
            None => Ok(()),
        }
    }

    /// Change how we are shown to others.
    pub async fn set_user(&mut self, user: UserProfile) -> Result<(), SyncError> {
        self.user = user.clone();
        self.replica.lock().await.send_awareness(AwarenessFields::user(user)).await
    }

    /// Everyone present on the board, ourselves included.
    pub async fn awareness_snapshot(&self) -> HashMap<ClientId, AwarenessEntry> {
        self.replica.lock().await.awareness.snapshot()
    }

    pub async fn awareness_events(&self) -> broadcast::Receiver<AwarenessEvent> {
        self.replica.lock().await.awareness.subscribe()
    }

    // ─── Session info ─────────────────────────────────────────────────

    /// Send a protocol-level ping.
    pub async fn send_ping(&self) -> Result<(), SyncError> {
        self.replica.lock().await.ping().await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Id assigned by the server in the last `Welcome`.
    pub async fn client_id(&self) -> Option<ClientId> {
        self.replica.lock().await.client_id
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn user(&self) -> &UserProfile {
        &self.user
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.replica.lock().await.queue.len()
    }

    /// Transactions sent this session that the server has not confirmed.
    pub async fn unconfirmed_len(&self) -> usize {
        self.replica.lock().await.unacked.len()
    }

    /// Direct access to the replica, for tools that batch many edits.
    pub fn replica(&self) -> &Arc<Mutex<LocalReplica>> {
        &self.replica
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// Wait for the server's first message, mapping a close frame to its reason.
async fn read_welcome(source: &mut WsSource) -> Result<ServerMessage, SyncError> {
    while let Some(msg) = source.next().await {
        match msg? {
            Message::Binary(data) => return Ok(ServerMessage::decode(&data)?),
            Message::Close(frame) => {
                let reason = frame.and_then(|f| CloseReason::from_code(u16::from(f.code)));
                return Err(match reason {
                    Some(reason) => ProtocolError::ClosedByServer(reason),
                    None => ProtocolError::ConnectionClosed,
                }
                .into());
            }
            _ => {}
        }
    }
    Err(ProtocolError::ConnectionClosed.into())
}
