//! Awareness: ephemeral presence of the people connected to a board.
//!
//! ## Architecture
//!
//! ```text
//! set_cursor() on a client
//!       │  CursorThrottle (30fps)
//!       ▼
//! ClientMessage::Awareness(fields)
//!       │
//!       ▼  hub: AwarenessChannel::set_local(conn's own client_id, fields)
//! AwarenessEvent::Updated(entry)
//!       │  (broadcast to every other connection)
//!       ▼
//! AwarenessChannel::apply_remote()  on each client
//! ```
//!
//! Entries are keyed by connection, never persisted, and removed as soon as
//! their connection closes or stays silent past the idle timeout.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use crate::element::Vec2;
use crate::protocol::ClientId;

const EVENT_CAPACITY: usize = 256;

/// Cursor updates are rate-limited to 30fps.
pub const CURSOR_INTERVAL: Duration = Duration::from_millis(33);

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// RGBA color for a user's cursor and selection outline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a uuid.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb`, alpha dropped.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

/// How a user is shown to others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub display_name: String,
    pub color: CursorColor,
}

impl UserProfile {
    pub fn new(display_name: impl Into<String>, color: CursorColor) -> Self {
        Self { display_name: display_name.into(), color }
    }

    /// Placeholder for connections that never announced themselves.
    pub fn guest(client_id: ClientId) -> Self {
        Self::new("Guest", CursorColor::from_uuid(client_id))
    }
}

// ───────────────────────────────────────────────────────────────────
// Entries and events
// ───────────────────────────────────────────────────────────────────

/// Presence of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    /// Authenticated user behind the connection, if known.
    pub user_id: Option<String>,
    pub user: UserProfile,
    /// `None` while the pointer is off the canvas.
    pub cursor: Option<Vec2>,
    /// Bumped on every write; receivers drop anything older.
    pub clock: u64,
}

/// Partial update of the caller's own entry. Absent fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessFields {
    pub user: Option<UserProfile>,
    pub cursor: Option<Option<Vec2>>,
}

impl AwarenessFields {
    pub fn cursor(position: Option<Vec2>) -> Self {
        Self { user: None, cursor: Some(position) }
    }

    pub fn user(profile: UserProfile) -> Self {
        Self { user: Some(profile), cursor: None }
    }

    /// Empty updates only renew the entry's liveness.
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.cursor.is_none()
    }
}

/// Presence change, both as a local notification and on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessEvent {
    Updated(AwarenessEntry),
    Removed { client_id: ClientId },
}

impl AwarenessEvent {
    pub fn client_id(&self) -> ClientId {
        match self {
            AwarenessEvent::Updated(entry) => entry.client_id,
            AwarenessEvent::Removed { client_id } => *client_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Channel
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Tracked {
    entry: AwarenessEntry,
    last_seen: Instant,
}

/// Map of connection → presence with change notifications.
#[derive(Debug)]
pub struct AwarenessChannel {
    entries: HashMap<ClientId, Tracked>,
    events: broadcast::Sender<AwarenessEvent>,
}

impl AwarenessChannel {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { entries: HashMap::new(), events }
    }

    /// Create (or reset) the entry for a freshly joined connection.
    pub fn register(&mut self, client_id: ClientId, user_id: Option<String>, user: UserProfile) -> AwarenessEntry {
        let clock = self.entries.get(&client_id).map_or(0, |t| t.entry.clock + 1);
        let entry = AwarenessEntry { client_id, user_id, user, cursor: None, clock };
        self.store(entry.clone());
        entry
    }

    /// Merge `fields` into the caller's own entry.
    ///
    /// Unknown connections get a guest entry first. Empty fields only
    /// renew liveness and emit nothing.
    pub fn set_local(&mut self, client_id: ClientId, fields: AwarenessFields) -> AwarenessEntry {
        let now = Instant::now();
        let tracked = self.entries.entry(client_id).or_insert_with(|| Tracked {
            entry: AwarenessEntry {
                client_id,
                user_id: None,
                user: UserProfile::guest(client_id),
                cursor: None,
                clock: 0,
            },
            last_seen: now,
        });
        tracked.last_seen = now;
        if fields.is_empty() {
            return tracked.entry.clone();
        }

        if let Some(user) = fields.user {
            tracked.entry.user = user;
        }
        if let Some(cursor) = fields.cursor {
            tracked.entry.cursor = cursor;
        }
        tracked.entry.clock += 1;

        let entry = tracked.entry.clone();
        let _ = self.events.send(AwarenessEvent::Updated(entry.clone()));
        entry
    }

    /// Drop an entry. Emits `Removed` when it existed.
    pub fn remove(&mut self, client_id: &ClientId) -> Option<AwarenessEntry> {
        let removed = self.entries.remove(client_id)?;
        let _ = self.events.send(AwarenessEvent::Removed { client_id: *client_id });
        Some(removed.entry)
    }

    /// Apply an event received from the hub. Returns false when it was
    /// stale or redundant.
    pub fn apply_remote(&mut self, event: AwarenessEvent) -> bool {
        match event {
            AwarenessEvent::Updated(entry) => {
                if let Some(current) = self.entries.get(&entry.client_id) {
                    if entry.clock < current.entry.clock || current.entry == entry {
                        return false;
                    }
                }
                self.store(entry);
                true
            }
            AwarenessEvent::Removed { client_id } => self.remove(&client_id).is_some(),
        }
    }

    /// Replace every entry, e.g. with the list received on join.
    pub fn replace_all(&mut self, entries: Vec<AwarenessEntry>) {
        let stale: Vec<ClientId> = self
            .entries
            .keys()
            .filter(|id| !entries.iter().any(|e| e.client_id == **id))
            .copied()
            .collect();
        for client_id in stale {
            self.remove(&client_id);
        }
        for entry in entries {
            self.apply_remote(AwarenessEvent::Updated(entry));
        }
    }

    /// Remove entries not heard from for longer than `timeout`.
    pub fn expire_idle(&mut self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let expired: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for client_id in &expired {
            self.remove(client_id);
        }
        expired
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&AwarenessEntry> {
        self.entries.get(client_id).map(|t| &t.entry)
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.entries.contains_key(client_id)
    }

    pub fn snapshot(&self) -> HashMap<ClientId, AwarenessEntry> {
        self.entries.iter().map(|(id, t)| (*id, t.entry.clone())).collect()
    }

    pub fn entries(&self) -> Vec<AwarenessEntry> {
        self.entries.values().map(|t| t.entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessEvent> {
        self.events.subscribe()
    }

    fn store(&mut self, entry: AwarenessEntry) {
        let event = AwarenessEvent::Updated(entry.clone());
        self.entries.insert(entry.client_id, Tracked { entry, last_seen: Instant::now() });
        let _ = self.events.send(event);
    }
}

impl Default for AwarenessChannel {
    fn default() -> Self {
        Self::new()
    }
}

// ───────────────────────────────────────────────────────────────────
// Cursor throttle
// ───────────────────────────────────────────────────────────────────

/// Client-side rate limiter for cursor updates.
///
/// Positions offered faster than the interval are held back; the latest
/// one can be sent later with [`flush`](Self::flush).
#[derive(Debug)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<Option<Vec2>>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_sent: None, pending: None }
    }

    /// Returns the position to send now, or `None` when throttled.
    pub fn offer(&mut self, position: Option<Vec2>, now: Instant) -> Option<Option<Vec2>> {
        let ready = self
            .last_sent
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if ready {
            self.last_sent = Some(now);
            self.pending = None;
            Some(position)
        } else {
            self.pending = Some(position);
            None
        }
    }

    /// Take the held-back position regardless of the interval.
    pub fn flush(&mut self, now: Instant) -> Option<Option<Vec2>> {
        let pending = self.pending.take()?;
        self.last_sent = Some(now);
        Some(pending)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(CURSOR_INTERVAL)
    }
}
