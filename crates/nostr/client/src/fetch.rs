//! One-shot queries: when [`RelayPool::fetch`](crate::RelayPool::fetch)
//! stops collecting.

use crate::relay_url::RelayUrl;
use crate::subscription::SubscriptionListener;
use nostr::Event;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Predicate selecting which events a fetch keeps.
pub type EventPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// When a fetch is complete. A relay-initiated close or the fetch timeout
/// ends every policy.
#[derive(Clone, Default)]
pub enum FetchPolicy {
    /// Collect everything until every relay sent EOSE or was removed.
    #[default]
    AllEose,
    /// Collect events accepted by `matching` (all events when `None`) until
    /// `count` were kept. A `count` of 0 never ends on its own. With
    /// `end_on_eose` the aggregate EOSE ends it too.
    WaitForEvents {
        count: usize,
        end_on_eose: bool,
        matching: Option<EventPredicate>,
    },
}

impl FetchPolicy {
    /// Wait for `count` events, ignoring EOSE.
    pub fn wait_for(count: usize) -> Self {
        FetchPolicy::WaitForEvents {
            count,
            end_on_eose: false,
            matching: None,
        }
    }

    /// Also finish on aggregate EOSE. No effect on `AllEose`.
    pub fn end_on_eose(mut self, end: bool) -> Self {
        if let FetchPolicy::WaitForEvents { end_on_eose, .. } = &mut self {
            *end_on_eose = end;
        }
        self
    }

    /// Keep only events accepted by `predicate`. No effect on `AllEose`.
    pub fn matching(mut self, predicate: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        if let FetchPolicy::WaitForEvents { matching, .. } = &mut self {
            *matching = Some(Arc::new(predicate));
        }
        self
    }
}

impl std::fmt::Debug for FetchPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchPolicy::AllEose => f.write_str("AllEose"),
            FetchPolicy::WaitForEvents {
                count,
                end_on_eose,
                matching,
            } => f
                .debug_struct("WaitForEvents")
                .field("count", count)
                .field("end_on_eose", end_on_eose)
                .field("matching", &matching.is_some())
                .finish(),
        }
    }
}

/// Listener collecting a fetch's events and signalling when its policy is met.
pub(crate) struct FetchCollector {
    policy: FetchPolicy,
    events: Mutex<Vec<Arc<Event>>>,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

impl FetchCollector {
    pub(crate) fn new(policy: FetchPolicy) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let collector = Arc::new(Self {
            policy,
            events: Mutex::new(Vec::new()),
            done: Mutex::new(Some(tx)),
        });
        (collector, rx)
    }

    fn finish(&self) {
        if let Some(tx) = self.done.lock().take() {
            let _ = tx.send(());
        }
    }

    fn finished(&self) -> bool {
        self.done.lock().is_none()
    }

    pub(crate) fn take_events(&self) -> Vec<Arc<Event>> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl SubscriptionListener for FetchCollector {
    fn on_event(&self, event: &Arc<Event>, _relay: &RelayUrl, _stored: bool) {
        if self.finished() {
            return;
        }
        let kept = match &self.policy {
            FetchPolicy::AllEose => {
                self.events.lock().push(Arc::clone(event));
                return;
            }
            FetchPolicy::WaitForEvents {
                count, matching, ..
            } => {
                if !matching.as_ref().is_none_or(|accept| accept(event)) {
                    return;
                }
                let mut events = self.events.lock();
                events.push(Arc::clone(event));
                *count > 0 && events.len() >= *count
            }
        };
        if kept {
            self.finish();
        }
    }

    fn on_eose(&self, _relay: &RelayUrl, all: bool) {
        let ends = match &self.policy {
            FetchPolicy::AllEose => true,
            FetchPolicy::WaitForEvents { end_on_eose, .. } => *end_on_eose,
        };
        if all && ends {
            self.finish();
        }
    }

    fn on_close(&self, _reasons: &[String]) {
        self.finish();
    }
}
