//! Pool-wide diagnostics fan-in.
//!
//! Relay NOTICE frames, connection failures and undecodable frames are all
//! published here. Registered callbacks run in registration order on the task
//! that produced the notice; a panicking callback is logged and skipped.
//! The same notices are also sent on a broadcast channel for async consumers.

use crate::relay_url::RelayUrl;
use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::warn;

/// Where a notice came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    /// A relay sent `["NOTICE", ...]`
    Relay,
    /// Connecting to, or staying connected to, a relay failed
    ConnectionError,
    /// A relay sent a frame that could not be decoded
    ProtocolError,
}

/// A diagnostic from one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub relay_url: RelayUrl,
    pub message: String,
    pub kind: NoticeKind,
}

/// Callback registered with [`NoticeBus::add_listener`].
pub type NoticeListener = Arc<dyn Fn(&Notice) + Send + Sync>;

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Run a user callback, logging instead of unwinding if it panics.
pub(crate) fn call_guarded(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("{} listener panicked", what);
    }
}

pub struct NoticeBus {
    listeners: RwLock<Vec<(ListenerId, NoticeListener)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<Notice>,
}

impl NoticeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            sender,
        }
    }

    pub fn add_listener(&self, listener: impl Fn(&Notice) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Returns false when `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    pub fn publish(&self, notice: Notice) {
        let listeners: Vec<NoticeListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            call_guarded("Notice", || listener(&notice));
        }
        // No receivers is fine.
        let _ = self.sender.send(notice);
    }
}
