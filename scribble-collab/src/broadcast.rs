//! Fan-out of encoded frames to the connections of one room.
//!
//! Each peer owns a bounded outbound queue drained by its connection task.
//! Sends never wait: a peer whose queue is full is removed from the set and
//! told so through its close signal, so one slow connection cannot stall
//! the hub or the other peers.
//!
//! Frames are encoded once and shared (`Arc<Vec<u8>>`) across all queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::awareness::UserProfile;
use crate::protocol::{ClientId, CloseReason};

/// One encoded server message, shared by every queue it is pushed to.
pub type Frame = Arc<Vec<u8>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub peers_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters, readable from outside the hub task.
#[derive(Debug, Default)]
pub struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    peers_dropped: AtomicU64,
    active_peers: AtomicU64,
}

impl AtomicBroadcastStats {
    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            peers_dropped: self.peers_dropped.load(Ordering::Relaxed),
            active_peers: self.active_peers.load(Ordering::Relaxed) as usize,
        }
    }
}

/// The hub's ends of a connection's channels.
#[derive(Debug)]
pub struct PeerChannels {
    pub outbound: mpsc::Sender<Frame>,
    pub close: oneshot::Sender<CloseReason>,
}

impl PeerChannels {
    /// Create the channel pairs for one connection. The receivers go to the
    /// connection task.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>, oneshot::Receiver<CloseReason>) {
        let (outbound, outbound_rx) = mpsc::channel(capacity.max(1));
        let (close, close_rx) = oneshot::channel();
        (Self { outbound, close }, outbound_rx, close_rx)
    }
}

#[derive(Debug)]
struct Peer {
    user_id: String,
    user: UserProfile,
    outbound: mpsc::Sender<Frame>,
    close: Option<oneshot::Sender<CloseReason>>,
}

enum Delivery {
    Sent,
    Full,
    Closed,
}

impl Peer {
    fn deliver(&self, frame: &Frame) -> Delivery {
        match self.outbound.try_send(frame.clone()) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    fn kick(mut self, reason: CloseReason) {
        if let Some(close) = self.close.take() {
            let _ = close.send(reason);
        }
    }
}

/// Connections currently joined to one room.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: HashMap<ClientId, Peer>,
    stats: Arc<AtomicBroadcastStats>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, client_id: ClientId, user_id: String, user: UserProfile, channels: PeerChannels) {
        let peer = Peer {
            user_id,
            user,
            outbound: channels.outbound,
            close: Some(channels.close),
        };
        self.peers.insert(client_id, peer);
        self.sync_active();
    }

    /// Forget a peer without signalling it. Returns false if unknown.
    pub fn remove(&mut self, client_id: &ClientId) -> bool {
        let removed = self.peers.remove(client_id).is_some();
        self.sync_active();
        removed
    }

    /// Remove a peer and close its connection with `reason`.
    pub fn kick(&mut self, client_id: &ClientId, reason: CloseReason) -> bool {
        match self.peers.remove(client_id) {
            Some(peer) => {
                peer.kick(reason);
                self.sync_active();
                true
            }
            None => false,
        }
    }

    /// Queue `frame` for one peer. Returns the ids of peers dropped while
    /// doing so (at most the target).
    pub fn send_to(&mut self, client_id: &ClientId, frame: Frame) -> Vec<ClientId> {
        let delivery = match self.peers.get(client_id) {
            Some(peer) => peer.deliver(&frame),
            None => return Vec::new(),
        };
        self.settle(vec![(*client_id, delivery)])
    }

    /// Queue `frame` for every peer except `except`.
    ///
    /// Peers whose queue is full are dropped with [`CloseReason::Backpressure`];
    /// peers whose connection already went away are forgotten. Both are
    /// returned so the caller can clean up their presence.
    pub fn broadcast(&mut self, frame: Frame, except: Option<ClientId>) -> Vec<ClientId> {
        let outcomes: Vec<(ClientId, Delivery)> = self
            .peers
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .map(|(id, peer)| (*id, peer.deliver(&frame)))
            .collect();
        self.settle(outcomes)
    }

    fn settle(&mut self, outcomes: Vec<(ClientId, Delivery)>) -> Vec<ClientId> {
        let mut dropped = Vec::new();
        for (client_id, delivery) in outcomes {
            match delivery {
                Delivery::Sent => {
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Full => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    self.stats.peers_dropped.fetch_add(1, Ordering::Relaxed);
                    if let Some(peer) = self.peers.remove(&client_id) {
                        log::warn!("Dropping peer {client_id} ({}): outbound queue full", peer.user_id);
                        peer.kick(CloseReason::Backpressure);
                    }
                    dropped.push(client_id);
                }
                Delivery::Closed => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    if self.peers.remove(&client_id).is_some() {
                        log::debug!("Peer {client_id} went away before leaving");
                    }
                    dropped.push(client_id);
                }
            }
        }
        if !dropped.is_empty() {
            self.sync_active();
        }
        dropped
    }

    /// Close every connection, e.g. on shutdown.
    pub fn close_all(&mut self, reason: CloseReason) {
        for (_, peer) in self.peers.drain() {
            peer.kick(reason);
        }
        self.sync_active();
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.peers.contains_key(client_id)
    }

    pub fn user_id(&self, client_id: &ClientId) -> Option<&str> {
        self.peers.get(client_id).map(|p| p.user_id.as_str())
    }

    pub fn profile(&self, client_id: &ClientId) -> Option<&UserProfile> {
        self.peers.get(client_id).map(|p| &p.user)
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Shared handle to the counters.
    pub fn stats_handle(&self) -> Arc<AtomicBroadcastStats> {
        self.stats.clone()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats.snapshot()
    }

    fn sync_active(&self) {
        self.stats.active_peers.store(self.peers.len() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::CursorColor;
    use uuid::Uuid;

    fn profile() -> UserProfile {
        UserProfile::new("tester", CursorColor::default())
    }

    fn join(
        set: &mut PeerSet,
        capacity: usize,
    ) -> (ClientId, mpsc::Receiver<Frame>, oneshot::Receiver<CloseReason>) {
        let id = Uuid::new_v4();
        let (channels, rx, close_rx) = PeerChannels::new(capacity);
        set.add(id, "user".into(), profile(), channels);
        (id, rx, close_rx)
    }

    #[tokio::test]
    async fn test_broadcast_skips_origin() {
        let mut set = PeerSet::new();
        let (a, mut rx_a, _ca) = join(&mut set, 8);
        let (_b, mut rx_b, _cb) = join(&mut set, 8);
        let (_c, mut rx_c, _cc) = join(&mut set, 8);

        let dropped = set.broadcast(Arc::new(vec![1, 2, 3]), Some(a));
        assert!(dropped.is_empty());
        assert!(rx_a.try_recv().is_err());
        assert_eq!(*rx_b.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*rx_c.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(set.stats().frames_sent, 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_slow_peer() {
        let mut set = PeerSet::new();
        let (slow, _rx_slow, close_slow) = join(&mut set, 1);
        let (_fast, mut rx_fast, _cf) = join(&mut set, 8);

        assert!(set.broadcast(Arc::new(vec![1]), None).is_empty());
        let dropped = set.broadcast(Arc::new(vec![2]), None);
        assert_eq!(dropped, vec![slow]);
        assert!(!set.contains(&slow));
        assert_eq!(close_slow.await.unwrap(), CloseReason::Backpressure);

        assert_eq!(*rx_fast.recv().await.unwrap(), vec![1]);
        assert_eq!(*rx_fast.recv().await.unwrap(), vec![2]);
        let stats = set.stats();
        assert_eq!(stats.peers_dropped, 1);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_forgotten() {
        let mut set = PeerSet::new();
        let (gone, rx, _close) = join(&mut set, 4);
        drop(rx);
        let dropped = set.send_to(&gone, Arc::new(vec![9]));
        assert_eq!(dropped, vec![gone]);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_signals_everyone() {
        let mut set = PeerSet::new();
        let (_a, _ra, ca) = join(&mut set, 4);
        let (_b, _rb, cb) = join(&mut set, 4);
        set.close_all(CloseReason::Normal);
        assert!(set.is_empty());
        assert_eq!(ca.await.unwrap(), CloseReason::Normal);
        assert_eq!(cb.await.unwrap(), CloseReason::Normal);
    }

    #[test]
    fn test_remove_unknown() {
        let mut set = PeerSet::new();
        assert!(!set.remove(&Uuid::new_v4()));
        assert!(!set.kick(&Uuid::new_v4(), CloseReason::Normal));
    }
}
