use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    SessionBooked,
    SessionConfirmed,
    SessionCanceled,
    SessionReminder,
    SessionStarting,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationKind::SessionBooked => "session-booked",
            NotificationKind::SessionConfirmed => "session-confirmed",
            NotificationKind::SessionCanceled => "session-canceled",
            NotificationKind::SessionReminder => "session-reminder",
            NotificationKind::SessionStarting => "session-starting",
        };
        write!(f, "{s}")
    }
}

/// One outbound notification addressed to a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub recipient: Ulid,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

/// Delivery capability handed to the engine. Implementations must be
/// fire-and-forget: a failed delivery never fails the operation that
/// produced it.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notice: Notice);
}

/// Resolves user ids to display names for notification payloads.
pub trait Directory: Send + Sync {
    fn display_name(&self, user_id: Ulid) -> Option<String>;
}

/// Directory backed by an in-process map. Tenants populate it lazily.
#[derive(Default)]
pub struct MemoryDirectory {
    names: DashMap<Ulid, String>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: Ulid, name: String) {
        self.names.insert(user_id, name);
    }
}

impl Directory for MemoryDirectory {
    fn display_name(&self, user_id: Ulid) -> Option<String> {
        self.names.get(&user_id).map(|n| n.clone())
    }
}

/// Default sink: a per-user broadcast channel hub. Sending with no
/// subscriber is a no-op, so delivery is never on the request path's
/// critical section.
pub struct BroadcastHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to one user's notifications. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn remove(&self, user_id: &Ulid) {
        self.channels.remove(user_id);
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for BroadcastHub {
    fn deliver(&self, notice: Notice) {
        if let Some(sender) = self.channels.get(&notice.recipient) {
            let _ = sender.send(notice);
        }
    }
}
