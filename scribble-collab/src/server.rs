//! WebSocket connection gateway.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── SyncHub ("ROOM01") ── PersistenceAdapter
//!             ├── handshake ── HubRegistry                         │
//! Client B ──┘   (Hello, token)      └── SyncHub ("ROOM02")        ├── RocksBackend
//!                                            │                     └── MemoryBackend
//!                                  ┌─────────┼─────────┐
//!                                  ▼         ▼         ▼
//!                               Client A  Client B  Client C
//! ```
//!
//! Every accepted socket gets its own task. The task waits for a `Hello`,
//! verifies the token, joins the document's hub and then shuttles frames:
//! inbound messages go to the hub's command queue, outbound frames come
//! from the connection's bounded queue. The hub can end the session at any
//! time through the close signal (backpressure, shutdown).

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::awareness::UserProfile;
use crate::broadcast::{Frame, PeerChannels};
use crate::error::SyncError;
use crate::hub::{HubConfig, HubHandle, JoinRequest};
use crate::persistence::{PersistenceAdapter, RocksBackend, StoreConfig};
use crate::protocol::{
    validate_document_name, ClientId, ClientMessage, CloseReason, ProtocolError, ServerMessage,
    MAX_FRAME_SIZE,
};
use crate::registry::HubRegistry;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Frames buffered per connection before it is dropped
    pub outbound_queue_capacity: usize,
    /// Time allowed between accept and `Hello`
    pub handshake_timeout: Duration,
    /// Largest inbound websocket message
    pub max_frame_bytes: usize,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            outbound_queue_capacity: 256,
            handshake_timeout: Duration::from_secs(10),
            max_frame_bytes: MAX_FRAME_SIZE,
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_path: None,
            outbound_queue_capacity: 64,
            handshake_timeout: Duration::from_millis(500),
            max_frame_bytes: MAX_FRAME_SIZE,
            hub: HubConfig::for_testing(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_handshakes: u64,
    pub backpressure_drops: u64,
    pub active_rooms: usize,
}

struct Gateway {
    config: ServerConfig,
    registry: HubRegistry,
    verifier: Arc<dyn TokenVerifier>,
    stats: RwLock<ServerStats>,
    shutdown: watch::Sender<bool>,
}

/// The sync server. Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SyncServer {
    inner: Arc<Gateway>,
}

impl SyncServer {
    /// Create a server. Opens the RocksDB store when `storage_path` is set.
    pub fn new(config: ServerConfig, verifier: Arc<dyn TokenVerifier>) -> Result<Self, SyncError> {
        let persistence = match &config.storage_path {
            Some(path) => {
                let backend = RocksBackend::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("Persisting snapshots to {}", path.display());
                PersistenceAdapter::new(Arc::new(backend))
            }
            None => {
                log::warn!("No storage path configured, documents live in memory only");
                PersistenceAdapter::in_memory()
            }
        };
        Ok(Self::with_persistence(config, verifier, persistence))
    }

    /// Create a server on an explicit persistence adapter.
    pub fn with_persistence(
        config: ServerConfig,
        verifier: Arc<dyn TokenVerifier>,
        persistence: PersistenceAdapter,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let registry = HubRegistry::new(config.hub.clone(), persistence);
        Self {
            inner: Arc::new(Gateway {
                config,
                registry,
                verifier,
                stats: RwLock::new(ServerStats::default()),
                shutdown,
            }),
        }
    }

    /// Bind `bind_addr` and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                log::info!("Sync server stopped accepting connections");
                return Ok(());
            }
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let gateway = self.inner.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gateway.handle_connection(stream, addr).await {
                            log::warn!("Connection from {addr} ended: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Stop accepting, flush every document and close all sessions.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.registry.shutdown_all().await;
        log::info!("Sync server shut down");
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.inner.stats.read().await.clone();
        stats.active_rooms = self.inner.registry.room_count().await;
        stats
    }

    pub fn registry(&self) -> &HubRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.inner.config.bind_addr
    }
}

/// Outcome of the handshake phase.
enum Handshake {
    Joined { client_id: ClientId, hub: HubHandle, outbound: mpsc::Receiver<Frame>, close: oneshot::Receiver<CloseReason> },
    /// Socket went away before saying hello.
    Gone,
}

impl Gateway {
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), SyncError> {
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.config.max_frame_bytes))
            .max_frame_size(Some(self.config.max_frame_bytes));
        let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
        let (mut sink, mut source) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = match self.handshake(&mut sink, &mut source).await {
            Ok(Handshake::Joined { client_id, hub, outbound, close }) => {
                let result = self.session(&mut sink, &mut source, client_id, &hub, outbound, close).await;
                hub.leave(client_id).await;
                result
            }
            Ok(Handshake::Gone) => Ok(()),
            Err(e) => {
                self.stats.write().await.rejected_handshakes += 1;
                Err(e)
            }
        };

        self.stats.write().await.active_connections -= 1;
        log::info!("Connection closed from {addr}");
        result
    }

    /// Read `Hello`, authenticate and join the hub.
    async fn handshake(&self, sink: &mut WsSink, source: &mut WsSource) -> Result<Handshake, SyncError> {
        let hello = match tokio::time::timeout(self.config.handshake_timeout, read_hello(source)).await {
            Ok(Ok(Some(hello))) => hello,
            Ok(Ok(None)) => return Ok(Handshake::Gone),
            Ok(Err(e)) => {
                close(sink, CloseReason::ProtocolViolation).await;
                return Err(e);
            }
            Err(_) => {
                log::debug!("Handshake timed out");
                close(sink, CloseReason::HandshakeTimeout).await;
                return Err(ProtocolError::Timeout.into());
            }
        };
        let (document, token, user) = hello;

        if let Err(e) = validate_document_name(&document) {
            close(sink, CloseReason::ProtocolViolation).await;
            return Err(e.into());
        }

        let identity = match self.verifier.verify(&token).await {
            Ok(identity) => identity,
            Err(e) => {
                log::info!("Rejected handshake for {document}: {e}");
                close(sink, CloseReason::Unauthorized).await;
                return Err(e.into());
            }
        };

        let client_id = Uuid::new_v4();
        let (channels, outbound, close_rx) = PeerChannels::new(self.config.outbound_queue_capacity);
        let request = JoinRequest { client_id, user_id: identity.user_id, user, channels };
        match self.registry.join(&document, request).await {
            Ok(hub) => Ok(Handshake::Joined { client_id, hub, outbound, close: close_rx }),
            Err(e) => {
                log::warn!("Could not join {document}: {e}");
                close(sink, CloseReason::HubUnavailable).await;
                Err(e.into())
            }
        }
    }

    async fn session(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
        client_id: ClientId,
        hub: &HubHandle,
        mut outbound: mpsc::Receiver<Frame>,
        mut close_rx: oneshot::Receiver<CloseReason>,
    ) -> Result<(), SyncError> {
        loop {
            tokio::select! {
                msg = source.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        self.dispatch(sink, client_id, hub, &data).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {
                        log::debug!("Ignoring non-binary frame from {client_id}");
                    }
                    Some(Err(e)) => return Err(e.into()),
                },

                frame = outbound.recv() => match frame {
                    Some(frame) => sink.send(Message::Binary(frame.to_vec().into())).await?,
                    None => {
                        // The hub forgot us without a reason (it is gone).
                        close(sink, CloseReason::HubUnavailable).await;
                        return Ok(());
                    }
                },

                reason = &mut close_rx => {
                    let reason = reason.unwrap_or(CloseReason::Normal);
                    // Deliver what the hub queued before it let go.
                    while let Ok(frame) = outbound.try_recv() {
                        sink.send(Message::Binary(frame.to_vec().into())).await?;
                    }
                    close(sink, reason).await;
                    if reason == CloseReason::Backpressure {
                        self.stats.write().await.backpressure_drops += 1;
                        return Err(SyncError::BackpressureDrop { client_id });
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Route one inbound frame of a joined session.
    async fn dispatch(
        &self,
        sink: &mut WsSink,
        client_id: ClientId,
        hub: &HubHandle,
        data: &[u8],
    ) -> Result<(), SyncError> {
        match ClientMessage::decode(data) {
            Ok(ClientMessage::Transaction(tx)) => hub.submit(client_id, tx).await?,
            Ok(ClientMessage::Awareness(fields)) => {
                log::trace!("Awareness update from {client_id}");
                hub.update_awareness(client_id, fields).await?
            }
            Ok(ClientMessage::Ping) => {
                sink.send(Message::Binary(ServerMessage::Pong.encode()?.into())).await?;
            }
            Ok(ClientMessage::Hello { .. }) => {
                let err = ProtocolError::UnexpectedMessage("hello");
                reject(sink, err.to_string()).await?;
            }
            Err(e) => {
                log::debug!("Undecodable frame from {client_id}: {e}");
                reject(sink, e.to_string()).await?;
            }
        }
        Ok(())
    }
}

/// Wait for the first binary frame and require it to be `Hello`.
async fn read_hello(source: &mut WsSource) -> Result<Option<(String, String, UserProfile)>, SyncError> {
    while let Some(msg) = source.next().await {
        match msg? {
            Message::Binary(data) => {
                return match ClientMessage::decode(&data)? {
                    ClientMessage::Hello { document, token, user } => Ok(Some((document, token, user))),
                    ClientMessage::Transaction(_) => Err(ProtocolError::UnexpectedMessage("transaction").into()),
                    ClientMessage::Awareness(_) => Err(ProtocolError::UnexpectedMessage("awareness").into()),
                    ClientMessage::Ping => Err(ProtocolError::UnexpectedMessage("ping").into()),
                };
            }
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

async fn reject(sink: &mut WsSink, reason: String) -> Result<(), SyncError> {
    let frame = ServerMessage::Rejected { stamp: None, reason }.encode()?;
    sink.send(Message::Binary(frame.into())).await?;
    Ok(())
}

async fn close(sink: &mut WsSink, reason: CloseReason) {
    let frame = CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: Utf8Bytes::from_static(reason.as_str()),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        log::debug!("Failed to send close frame ({}): {e}", reason.as_str());
    }
}
