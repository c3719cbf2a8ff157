//! Subscription state machine.
//!
//! A subscription targets a fixed set of relays. Frames from those relays are
//! applied to its state under one lock (verification, filter recheck, dedup,
//! EOSE bookkeeping), and the resulting callbacks are queued in order onto a
//! channel drained by a per-subscription dispatch task. Listeners therefore
//! never run under the state lock and never run concurrently with each other.
//!
//! ```text
//! Created --open--> Open --EOSE(r)--> PartialEose --EOSE(all)--> AllEose
//!    \                \                    \                        \
//!     `----------------`--------------------`---- close ------------`--> Closed
//! ```

use crate::dedup::EventTracker;
use crate::error::{ClientError, Result};
use crate::filter::{Filter, matches_any};
use crate::message::ClientMessage;
use crate::notice::call_guarded;
use crate::pool::PoolInner;
use crate::relay_url::RelayUrl;
use crate::stats::PoolStats;
use nostr::{Event, EventVerifier};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Produces subscription ids that are unique for the lifetime of a pool.
#[derive(Debug)]
pub(crate) struct SubscriptionIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SubscriptionIdGenerator {
    pub(crate) fn new() -> Self {
        Self {
            prefix: Uuid::new_v4().simple().to_string()[..8].to_string(),
            next: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_id(&self) -> String {
        format!("{}-{}", self.prefix, self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// REQ issued, delivery not started
    Created,
    /// Delivering, no relay has sent EOSE yet
    Open,
    /// Some relays have sent EOSE
    PartialEose,
    /// Every relay sent EOSE or was removed
    AllEose,
    /// Terminal
    Closed,
}

/// Receives a subscription's callbacks. Every method defaults to a no-op.
pub trait SubscriptionListener: Send + Sync {
    /// A verified, matching, not previously seen event. `stored` is true when
    /// the relay sent it before its EOSE.
    fn on_event(&self, _event: &Arc<Event>, _relay: &RelayUrl, _stored: bool) {}

    /// `relay` finished sending stored events. `all` is true exactly once,
    /// on the call that completes the subscription's relay set (a relay being
    /// removed can complete it too).
    fn on_eose(&self, _relay: &RelayUrl, _all: bool) {}

    /// The subscription closed; called exactly once.
    fn on_close(&self, _reasons: &[String]) {}

    /// A relay serving this subscription sent a NOTICE.
    fn on_notice(&self, _relay: &RelayUrl, _message: &str) {}
}

struct EventCallback<F>(F);
struct EoseCallback<F>(F);
struct CloseCallback<F>(F);
struct NoticeCallback<F>(F);

impl<F> SubscriptionListener for EventCallback<F>
where
    F: Fn(&Arc<Event>, &RelayUrl, bool) + Send + Sync,
{
    fn on_event(&self, event: &Arc<Event>, relay: &RelayUrl, stored: bool) {
        (self.0)(event, relay, stored)
    }
}

impl<F> SubscriptionListener for EoseCallback<F>
where
    F: Fn(&RelayUrl, bool) + Send + Sync,
{
    fn on_eose(&self, relay: &RelayUrl, all: bool) {
        (self.0)(relay, all)
    }
}

impl<F> SubscriptionListener for CloseCallback<F>
where
    F: Fn(&[String]) + Send + Sync,
{
    fn on_close(&self, reasons: &[String]) {
        (self.0)(reasons)
    }
}

impl<F> SubscriptionListener for NoticeCallback<F>
where
    F: Fn(&RelayUrl, &str) + Send + Sync,
{
    fn on_notice(&self, relay: &RelayUrl, message: &str) {
        (self.0)(relay, message)
    }
}

enum Dispatch {
    Event {
        event: Arc<Event>,
        relay: RelayUrl,
        stored: bool,
    },
    Eose {
        relay: RelayUrl,
        all: bool,
    },
    Notice {
        relay: RelayUrl,
        message: String,
    },
    Close {
        reasons: Vec<String>,
    },
}

/// What happened to one inbound EVENT frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventOutcome {
    Delivered,
    Duplicate,
    Rejected,
    Mismatch,
    Ignored,
}

#[derive(Debug)]
struct RelaySlot {
    url: RelayUrl,
    eose: bool,
    active: bool,
    eose_expired: bool,
    req_sent: bool,
}

impl RelaySlot {
    fn settled(&self) -> bool {
        self.eose || !self.active || self.eose_expired
    }
}

struct SubState {
    relays: Vec<RelaySlot>,
    tracker: Option<Box<dyn EventTracker>>,
    opened: bool,
    closed: bool,
    all_eose_fired: bool,
    close_reasons: Vec<String>,
    dispatch: Option<mpsc::UnboundedSender<Dispatch>>,
    pending: Option<mpsc::UnboundedReceiver<Dispatch>>,
}

impl SubState {
    fn slot(&self, relay: &RelayUrl) -> Option<&RelaySlot> {
        self.relays.iter().find(|slot| slot.url == *relay)
    }

    fn slot_mut(&mut self, relay: &RelayUrl) -> Option<&mut RelaySlot> {
        self.relays.iter_mut().find(|slot| slot.url == *relay)
    }

    fn emit(&self, item: Dispatch) {
        if let Some(tx) = &self.dispatch {
            let _ = tx.send(item);
        }
    }

    /// Marks aggregate EOSE when every relay is settled. True only the first time.
    fn complete_eose(&mut self) -> bool {
        if self.all_eose_fired || !self.relays.iter().all(RelaySlot::settled) {
            return false;
        }
        self.all_eose_fired = true;
        true
    }

    fn has_active_relays(&self) -> bool {
        self.relays.iter().any(|slot| slot.active)
    }

    fn finish(&mut self) {
        self.closed = true;
        self.emit(Dispatch::Close {
            reasons: self.close_reasons.clone(),
        });
        self.dispatch = None;
        self.tracker = None;
    }
}

pub(crate) struct SubscriptionInner {
    id: String,
    filters: Vec<Filter>,
    req: String,
    verifier: Arc<dyn EventVerifier>,
    stats: Arc<PoolStats>,
    eose_timeout: Option<Duration>,
    state: Mutex<SubState>,
    listeners: Mutex<Vec<Arc<dyn SubscriptionListener>>>,
    detached: AtomicBool,
}

impl SubscriptionInner {
    pub(crate) fn new(
        id: String,
        filters: Vec<Filter>,
        relays: Vec<RelayUrl>,
        verifier: Arc<dyn EventVerifier>,
        stats: Arc<PoolStats>,
        eose_timeout: Option<Duration>,
        mut tracker: Box<dyn EventTracker>,
    ) -> Result<Arc<Self>> {
        tracker.tune_for(&filters);
        let req = ClientMessage::Req {
            subscription_id: id.clone(),
            filters: filters.clone(),
        }
        .to_json()?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            id,
            filters,
            req,
            verifier,
            stats,
            eose_timeout,
            state: Mutex::new(SubState {
                relays: relays
                    .into_iter()
                    .map(|url| RelaySlot {
                        url,
                        eose: false,
                        active: true,
                        eose_expired: false,
                        req_sent: false,
                    })
                    .collect(),
                tracker: Some(tracker),
                opened: false,
                closed: false,
                all_eose_fired: false,
                close_reasons: Vec::new(),
                dispatch: Some(tx),
                pending: Some(rx),
            }),
            listeners: Mutex::new(Vec::new()),
            detached: AtomicBool::new(false),
        }))
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Encoded `["REQ", id, filters...]`.
    pub(crate) fn req_frame(&self) -> &str {
        &self.req
    }

    pub(crate) fn close_frame(&self) -> Result<String> {
        Ok(ClientMessage::Close {
            subscription_id: self.id.clone(),
        }
        .to_json()?)
    }

    /// Relay is targeted and has not closed or been removed.
    pub(crate) fn serves(&self, relay: &RelayUrl) -> bool {
        let st = self.state.lock();
        !st.closed && st.slot(relay).is_some_and(|slot| slot.active)
    }

    /// Marks REQ as sent to `relay` for its current session. False when it
    /// already was, or the relay no longer serves this subscription.
    pub(crate) fn claim_req(&self, relay: &RelayUrl) -> bool {
        let mut st = self.state.lock();
        if st.closed {
            return false;
        }
        match st.slot_mut(relay) {
            Some(slot) if slot.active && !slot.req_sent => {
                slot.req_sent = true;
                true
            }
            _ => false,
        }
    }

    /// The session with `relay` ended; REQ has to go out again.
    pub(crate) fn reset_req(&self, relay: &RelayUrl) {
        if let Some(slot) = self.state.lock().slot_mut(relay) {
            slot.req_sent = false;
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        self.listeners.lock().push(listener);
    }

    /// Start delivery. Frames received so far are dispatched first.
    pub(crate) fn open(self: &Arc<Self>) {
        let (rx, arm_timer) = {
            let mut st = self.state.lock();
            if st.opened {
                return;
            }
            st.opened = true;
            (st.pending.take(), !st.closed && !st.all_eose_fired)
        };
        if let Some(rx) = rx {
            self.spawn_dispatcher(rx);
        }
        if let (true, Some(eose_timeout)) = (arm_timer, self.eose_timeout) {
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(eose_timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.expire_eose();
                }
            });
        }
    }

    pub(crate) fn handle_event(&self, relay: &RelayUrl, event: Event) -> EventOutcome {
        if !self.serves(relay) {
            return EventOutcome::Ignored;
        }

        // Verification runs before anything is recorded for this id.
        if let Err(err) = self.verifier.verify(&event) {
            PoolStats::incr(&self.stats.verification_failures);
            warn!(
                "Dropping event {} from {} on {}: {}",
                event.id,
                relay,
                self.id,
                ClientError::VerificationFailure(err.to_string())
            );
            return EventOutcome::Rejected;
        }

        if !matches_any(&self.filters, &event) {
            PoolStats::incr(&self.stats.filter_mismatches);
            debug!(
                "Event {} from {} does not match filters of {}",
                event.id, relay, self.id
            );
            return EventOutcome::Mismatch;
        }

        let mut st = self.state.lock();
        if st.closed {
            return EventOutcome::Ignored;
        }
        let stored = match st.slot(relay) {
            Some(slot) if slot.active => !slot.eose,
            _ => return EventOutcome::Ignored,
        };
        let seen = st.tracker.as_mut().is_some_and(|tracker| tracker.seen(&event));
        if seen {
            PoolStats::incr(&self.stats.duplicates_suppressed);
            return EventOutcome::Duplicate;
        }
        PoolStats::incr(&self.stats.events_delivered);
        st.emit(Dispatch::Event {
            event: Arc::new(event),
            relay: relay.clone(),
            stored,
        });
        EventOutcome::Delivered
    }

    pub(crate) fn handle_eose(&self, relay: &RelayUrl) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        match st.slot_mut(relay) {
            Some(slot) if slot.active && !slot.eose => slot.eose = true,
            _ => return,
        }
        let all = st.complete_eose();
        if all {
            debug!("Subscription {} received EOSE from every relay", self.id);
        }
        st.emit(Dispatch::Eose {
            relay: relay.clone(),
            all,
        });
    }

    pub(crate) fn handle_notice(&self, relay: &RelayUrl, message: &str) {
        let st = self.state.lock();
        if st.closed || !st.slot(relay).is_some_and(|slot| slot.active) {
            return;
        }
        st.emit(Dispatch::Notice {
            relay: relay.clone(),
            message: message.to_string(),
        });
    }

    /// `relay` stopped serving this subscription (relay CLOSED frame, or the
    /// pool dropped the relay). Returns true when this closed the subscription.
    pub(crate) fn remove_relay(&self, relay: &RelayUrl, reason: String) -> bool {
        let mut st = self.state.lock();
        if st.closed {
            return false;
        }
        match st.slot_mut(relay) {
            Some(slot) if slot.active => slot.active = false,
            _ => return false,
        }
        debug!("Relay {} left subscription {}: {}", relay, self.id, reason);
        st.close_reasons.push(reason);

        if st.complete_eose() {
            st.emit(Dispatch::Eose {
                relay: relay.clone(),
                all: true,
            });
        }
        if st.has_active_relays() {
            return false;
        }
        st.finish();
        true
    }

    /// Stop waiting for EOSE from relays that have not sent it.
    pub(crate) fn expire_eose(&self) {
        let mut st = self.state.lock();
        if st.closed || st.all_eose_fired {
            return;
        }
        let mut expired: Vec<RelayUrl> = Vec::new();
        for slot in st.relays.iter_mut().filter(|slot| !slot.settled()) {
            slot.eose_expired = true;
            expired.push(slot.url.clone());
        }
        warn!(
            "Subscription {} gave up waiting for EOSE from {:?}",
            self.id, expired
        );
        if st.complete_eose() {
            if let Some(relay) = expired.into_iter().next() {
                st.emit(Dispatch::Eose { relay, all: true });
            }
        }
    }

    /// Close from the caller side (unsubscribe, pool shutdown). Nothing is
    /// delivered after this returns except the close callback.
    ///
    /// Returns the relays that were still serving the subscription, or `None`
    /// when it was already closed.
    pub(crate) fn close(self: &Arc<Self>, reason: Option<String>) -> Option<Vec<RelayUrl>> {
        self.detached.store(true, Ordering::SeqCst);
        let (served, rx) = {
            let mut st = self.state.lock();
            if st.closed {
                return None;
            }
            let served: Vec<RelayUrl> = st
                .relays
                .iter()
                .filter(|slot| slot.active)
                .map(|slot| slot.url.clone())
                .collect();
            if let Some(reason) = reason {
                st.close_reasons.push(reason);
            }
            st.finish();
            // Never opened: the close callback still has to fire.
            let rx = if st.opened { None } else { st.pending.take() };
            st.opened = true;
            (served, rx)
        };
        if let Some(rx) = rx {
            self.spawn_dispatcher(rx);
        }
        Some(served)
    }

    pub(crate) fn relays(&self) -> Vec<RelayUrl> {
        self.state
            .lock()
            .relays
            .iter()
            .map(|slot| slot.url.clone())
            .collect()
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        let st = self.state.lock();
        if st.closed {
            SubscriptionState::Closed
        } else if !st.opened {
            SubscriptionState::Created
        } else if st.all_eose_fired {
            SubscriptionState::AllEose
        } else if st.relays.iter().any(|slot| slot.eose) {
            SubscriptionState::PartialEose
        } else {
            SubscriptionState::Open
        }
    }

    pub(crate) fn close_reasons(&self) -> Vec<String> {
        self.state.lock().close_reasons.clone()
    }

    fn spawn_dispatcher(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
        let inner = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    while let Some(item) = rx.recv().await {
                        if !inner.dispatch(item) {
                            break;
                        }
                    }
                });
            }
            Err(_) => {
                // Outside a runtime only already-queued callbacks can be run.
                while let Ok(item) = rx.try_recv() {
                    if !inner.dispatch(item) {
                        break;
                    }
                }
            }
        }
    }

    /// Deliver one item. False once the close callback ran.
    fn dispatch(&self, item: Dispatch) -> bool {
        if let Dispatch::Close { reasons } = item {
            let listeners = std::mem::take(&mut *self.listeners.lock());
            for listener in listeners {
                call_guarded("Close", || listener.on_close(&reasons));
            }
            return false;
        }
        if self.detached.load(Ordering::SeqCst) {
            return true;
        }

        let listeners: Vec<Arc<dyn SubscriptionListener>> = self.listeners.lock().clone();
        for listener in listeners {
            // Unsubscribing from inside a callback stops delivery right away.
            if self.detached.load(Ordering::SeqCst) {
                break;
            }
            match &item {
                Dispatch::Event {
                    event,
                    relay,
                    stored,
                } => call_guarded("Event", || listener.on_event(event, relay, *stored)),
                Dispatch::Eose { relay, all } => {
                    call_guarded("EOSE", || listener.on_eose(relay, *all))
                }
                Dispatch::Notice { relay, message } => {
                    call_guarded("Notice", || listener.on_notice(relay, message))
                }
                Dispatch::Close { .. } => {}
            }
        }
        true
    }
}

/// Handle to a subscription created by [`RelayPool::subscribe`](crate::RelayPool::subscribe).
///
/// Register listeners, then call [`open`](Self::open) to start delivery.
/// Cloning the handle does not duplicate the subscription.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
    pool: Weak<PoolInner>,
}

impl Subscription {
    pub(crate) fn new(inner: Arc<SubscriptionInner>, pool: Weak<PoolInner>) -> Self {
        Self { inner, pool }
    }

    pub(crate) fn inner(&self) -> &Arc<SubscriptionInner> {
        &self.inner
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.inner.filters
    }

    /// Every relay this subscription targeted.
    pub fn relays(&self) -> Vec<RelayUrl> {
        self.inner.relays()
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Reasons recorded so far: relay CLOSED messages and the caller's or
    /// pool's reason for closing.
    pub fn close_reasons(&self) -> Vec<String> {
        self.inner.close_reasons()
    }

    pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) -> &Self {
        self.inner.add_listener(listener);
        self
    }

    pub fn add_event_listener(
        &self,
        f: impl Fn(&Arc<Event>, &RelayUrl, bool) + Send + Sync + 'static,
    ) -> &Self {
        self.add_listener(Arc::new(EventCallback(f)))
    }

    pub fn add_eose_listener(&self, f: impl Fn(&RelayUrl, bool) + Send + Sync + 'static) -> &Self {
        self.add_listener(Arc::new(EoseCallback(f)))
    }

    pub fn add_close_listener(&self, f: impl Fn(&[String]) + Send + Sync + 'static) -> &Self {
        self.add_listener(Arc::new(CloseCallback(f)))
    }

    pub fn add_notice_listener(&self, f: impl Fn(&RelayUrl, &str) + Send + Sync + 'static) -> &Self {
        self.add_listener(Arc::new(NoticeCallback(f)))
    }

    /// Start delivering. Idempotent.
    pub fn open(&self) -> &Self {
        self.inner.open();
        self
    }

    /// Same as [`RelayPool::unsubscribe`](crate::RelayPool::unsubscribe).
    pub fn unsubscribe(&self) {
        match self.pool.upgrade() {
            Some(pool) => pool.unsubscribe(&self.inner),
            None => {
                self.inner.close(Some(ClientError::PoolClosed.to_string()));
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::{EventDeduplicator, PassthroughTracker};
    use nostr::{EventTemplate, Keys, SchnorrVerifier, Sha256Hasher, sign_event};
    use parking_lot::Mutex as PlMutex;

    fn relay(host: &str) -> RelayUrl {
        RelayUrl::parse(&format!("wss://{}", host)).unwrap()
    }

    fn signed(keys: &Keys, kind: u16, content: &str) -> Event {
        let template = EventTemplate {
            created_at: 1_700_000_000,
            kind,
            tags: vec![],
            content: content.to_string(),
        };
        sign_event(&template, keys, &Sha256Hasher).unwrap()
    }

    fn subscription(relays: &[&str]) -> (Arc<SubscriptionInner>, Arc<PoolStats>) {
        let stats = Arc::new(PoolStats::default());
        let inner = SubscriptionInner::new(
            "test-0".to_string(),
            vec![Filter::new().kinds([1])],
            relays.iter().map(|h| relay(h)).collect(),
            Arc::new(SchnorrVerifier::new()),
            Arc::clone(&stats),
            None,
            Box::new(EventDeduplicator::new()),
        )
        .unwrap();
        (inner, stats)
    }

    #[derive(Default)]
    struct Recorder {
        log: PlMutex<Vec<String>>,
    }

    impl SubscriptionListener for Recorder {
        fn on_event(&self, event: &Arc<Event>, relay: &RelayUrl, stored: bool) {
            self.log
                .lock()
                .push(format!("event {} {} {}", event.content, relay, stored));
        }
        fn on_eose(&self, relay: &RelayUrl, all: bool) {
            self.log.lock().push(format!("eose {} {}", relay, all));
        }
        fn on_close(&self, reasons: &[String]) {
            self.log.lock().push(format!("close {:?}", reasons));
        }
    }

    struct Panicker;

    impl SubscriptionListener for Panicker {
        fn on_event(&self, _event: &Arc<Event>, _relay: &RelayUrl, _stored: bool) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_subscription_ids_are_unique() {
        let ids = SubscriptionIdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(a.len() <= 64);
    }

    #[test]
    fn test_req_frame() {
        let (inner, _) = subscription(&["a.example"]);
        assert_eq!(inner.req_frame(), r#"["REQ","test-0",{"kinds":[1]}]"#);
        assert_eq!(inner.close_frame().unwrap(), r#"["CLOSE","test-0"]"#);
    }

    #[test]
    fn test_state_progression() {
        let (inner, _) = subscription(&["a.example", "b.example"]);
        assert_eq!(inner.state(), SubscriptionState::Created);

        inner.state.lock().opened = true;
        assert_eq!(inner.state(), SubscriptionState::Open);

        inner.handle_eose(&relay("a.example"));
        assert_eq!(inner.state(), SubscriptionState::PartialEose);

        inner.handle_eose(&relay("b.example"));
        assert_eq!(inner.state(), SubscriptionState::AllEose);
    }

    #[test]
    fn test_req_claimed_once_per_session() {
        let (inner, _) = subscription(&["a.example", "b.example"]);
        assert!(inner.claim_req(&relay("a.example")));
        assert!(!inner.claim_req(&relay("a.example")));
        assert!(!inner.claim_req(&relay("other.example")));

        inner.reset_req(&relay("a.example"));
        assert!(inner.claim_req(&relay("a.example")));

        inner.remove_relay(&relay("b.example"), "blocked".to_string());
        assert!(!inner.claim_req(&relay("b.example")));
    }

    #[test]
    fn test_verification_precedes_dedup() {
        let keys = Keys::generate();
        let (inner, stats) = subscription(&["a.example", "b.example"]);
        let genuine = signed(&keys, 1, "hello");
        let mut forged = genuine.clone();
        forged.sig = "00".repeat(64);

        assert_eq!(
            inner.handle_event(&relay("a.example"), forged),
            EventOutcome::Rejected
        );
        assert_eq!(
            inner.handle_event(&relay("b.example"), genuine.clone()),
            EventOutcome::Delivered
        );
        assert_eq!(
            inner.handle_event(&relay("a.example"), genuine),
            EventOutcome::Duplicate
        );
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.verification_failures, 1);
        assert_eq!(snapshot.duplicates_suppressed, 1);
    }

    #[test]
    fn test_tracker_decides_duplicates() {
        let keys = Keys::generate();
        let inner = SubscriptionInner::new(
            "pass-0".to_string(),
            vec![Filter::new()],
            vec![relay("a.example")],
            Arc::new(SchnorrVerifier::new()),
            Arc::new(PoolStats::default()),
            None,
            Box::new(PassthroughTracker),
        )
        .unwrap();
        let event = signed(&keys, 1, "again");

        assert_eq!(
            inner.handle_event(&relay("a.example"), event.clone()),
            EventOutcome::Delivered
        );
        assert_eq!(
            inner.handle_event(&relay("a.example"), event),
            EventOutcome::Delivered
        );
    }

    #[test]
    fn test_filter_recheck_and_untargeted_relay() {
        let keys = Keys::generate();
        let (inner, stats) = subscription(&["a.example"]);

        assert_eq!(
            inner.handle_event(&relay("a.example"), signed(&keys, 7, "reaction")),
            EventOutcome::Mismatch
        );
        assert_eq!(
            inner.handle_event(&relay("other.example"), signed(&keys, 1, "note")),
            EventOutcome::Ignored
        );
        assert_eq!(stats.snapshot().filter_mismatches, 1);
    }

    #[test]
    fn test_relay_removal_completes_eose_and_closes() {
        let (inner, _) = subscription(&["a.example", "b.example"]);
        inner.handle_eose(&relay("a.example"));

        assert!(!inner.remove_relay(&relay("a.example"), "blocked".to_string()));
        assert!(!inner.state.lock().all_eose_fired);

        assert!(inner.remove_relay(&relay("b.example"), "auth-required".to_string()));
        assert!(inner.is_closed());
        assert_eq!(inner.close_reasons(), vec!["blocked", "auth-required"]);
        // Already closed: later CLOSED frames are ignored.
        assert!(!inner.remove_relay(&relay("b.example"), "again".to_string()));
    }

    #[tokio::test]
    async fn test_dispatch_order_and_single_close() {
        let keys = Keys::generate();
        let (inner, _) = subscription(&["a.example", "b.example"]);
        let recorder = Arc::new(Recorder::default());
        inner.add_listener(recorder.clone());

        inner.handle_event(&relay("a.example"), signed(&keys, 1, "one"));
        inner.handle_eose(&relay("a.example"));
        inner.handle_eose(&relay("a.example"));
        inner.handle_event(&relay("a.example"), signed(&keys, 1, "two"));
        inner.handle_eose(&relay("b.example"));
        inner.open();
        inner.open();

        let served = inner.close(Some("done".to_string())).unwrap();
        assert_eq!(served.len(), 2);
        assert!(inner.close(Some("again".to_string())).is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Caller close drops undelivered frames but still reports the close.
        let log = recorder.log.lock().clone();
        assert_eq!(log.last().unwrap(), "close [\"done\"]");
        assert_eq!(log.iter().filter(|l| l.starts_with("close")).count(), 1);
    }

    #[tokio::test]
    async fn test_open_delivers_buffered_frames_in_order() {
        let keys = Keys::generate();
        let (inner, _) = subscription(&["a.example", "b.example"]);
        let recorder = Arc::new(Recorder::default());
        inner.add_listener(recorder.clone());

        inner.handle_event(&relay("a.example"), signed(&keys, 1, "one"));
        inner.handle_eose(&relay("a.example"));
        inner.handle_eose(&relay("a.example"));
        inner.handle_event(&relay("a.example"), signed(&keys, 1, "two"));
        inner.handle_eose(&relay("b.example"));
        inner.open();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            *recorder.log.lock(),
            vec![
                "event one wss://a.example true",
                "eose wss://a.example false",
                "event two wss://a.example false",
                "eose wss://b.example true",
            ]
        );
    }

    #[tokio::test]
    async fn test_eose_timeout_expires_slow_relays() {
        let stats = Arc::new(PoolStats::default());
        let inner = SubscriptionInner::new(
            "slow-0".to_string(),
            vec![Filter::new()],
            vec![relay("fast.example"), relay("slow.example")],
            Arc::new(SchnorrVerifier::new()),
            stats,
            Some(Duration::from_millis(10)),
            Box::new(EventDeduplicator::new()),
        )
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        inner.add_listener(recorder.clone());
        inner.open();
        inner.handle_eose(&relay("fast.example"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(inner.state(), SubscriptionState::AllEose);
        assert_eq!(
            *recorder.log.lock(),
            vec![
                "eose wss://fast.example false",
                "eose wss://slow.example true",
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_dispatch() {
        let keys = Keys::generate();
        let (inner, _) = subscription(&["a.example"]);
        let recorder = Arc::new(Recorder::default());
        inner.add_listener(Arc::new(Panicker));
        inner.add_listener(recorder.clone());
        inner.open();

        inner.handle_event(&relay("a.example"), signed(&keys, 1, "one"));
        inner.handle_event(&relay("a.example"), signed(&keys, 1, "two"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.log.lock().len(), 2);
    }
}
