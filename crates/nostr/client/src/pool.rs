//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool owns one [`RelayConnection`] per relay URL and routes everything
//! those connections report: subscription frames to their [`Subscription`],
//! OK frames to pending publishes, and diagnostics to the notice bus.
//! Relays are added lazily the first time a publish or subscribe names them.

use crate::config::PoolConfig;
use crate::dedup::{EventDeduplicator, EventTracker};
use crate::error::{ClientError, Result};
use crate::fetch::{FetchCollector, FetchPolicy};
use crate::filter::Filter;
use crate::message::{ClientMessage, RelayMessage};
use crate::notice::{ListenerId, Notice, NoticeBus, NoticeKind};
use crate::publisher::{PublishOutcome, Publisher, RelayAck};
use crate::relay::{ConnectionState, NotificationHandler, RelayConnection, RelayNotification};
use crate::relay_url::{RelayUrl, parse_relays};
use crate::stats::{PoolStats, StatsSnapshot};
use crate::subscription::{
    EventOutcome, Subscription, SubscriptionIdGenerator, SubscriptionInner, SubscriptionListener,
};
use crate::transport::{Transport, WebSocketTransport};
use futures::future::join_all;
use nostr::{Event, EventVerifier, SchnorrVerifier, sort_events};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest slice of an undecodable frame quoted in a protocol notice.
const MAX_QUOTED_FRAME: usize = 200;

pub(crate) struct PoolInner {
    config: PoolConfig,
    transport: Arc<dyn Transport>,
    verifier: Arc<dyn EventVerifier>,
    relays: RwLock<HashMap<RelayUrl, Arc<RelayConnection>>>,
    subscriptions: RwLock<HashMap<String, Arc<SubscriptionInner>>>,
    ids: SubscriptionIdGenerator,
    publisher: Publisher,
    notices: NoticeBus,
    stats: Arc<PoolStats>,
    closed: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
    this: Weak<PoolInner>,
}

impl PoolInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::PoolClosed);
        }
        Ok(())
    }

    fn handler(&self) -> NotificationHandler {
        let pool = self.this.clone();
        Arc::new(move |url: &RelayUrl, notification: RelayNotification| {
            if let Some(pool) = pool.upgrade() {
                pool.on_notification(url, notification);
            }
        })
    }

    /// The live connection for `url`, created and started if missing.
    fn ensure_relay(&self, url: &RelayUrl) -> Arc<RelayConnection> {
        if let Some(conn) = self.relays.read().get(url)
            && conn.state() != ConnectionState::Closed
        {
            return Arc::clone(conn);
        }

        let conn = {
            let mut relays = self.relays.write();
            let stale = relays
                .get(url)
                .is_some_and(|conn| conn.state() == ConnectionState::Closed);
            if stale {
                relays.remove(url);
            }
            Arc::clone(relays.entry(url.clone()).or_insert_with(|| {
                info!("Adding relay to pool: {}", url);
                Arc::new(RelayConnection::new(
                    url.clone(),
                    self.config.relay.clone(),
                    Arc::clone(&self.transport),
                    self.handler(),
                ))
            }))
        };
        conn.connect();
        self.start_reaper();
        conn
    }

    /// Spawn the task disconnecting idle relays, once per pool.
    fn start_reaper(&self) {
        let Some(keep_alive) = self.config.relay.keep_alive else {
            return;
        };
        let mut reaper = self.reaper.lock();
        if reaper.is_some() || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let pool = self.this.clone();
        let period = (keep_alive / 4).max(Duration::from_millis(10));
        *reaper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if pool.closed.load(Ordering::SeqCst) {
                    break;
                }
                pool.reap_idle(keep_alive);
            }
        }));
    }

    /// Disconnect relays that serve no subscription, wait for no OK, and
    /// have been silent for `keep_alive`. They reconnect on next use.
    fn reap_idle(&self, keep_alive: Duration) {
        let candidates: Vec<RelayUrl> = self
            .relays
            .read()
            .iter()
            .filter(|(_, conn)| {
                conn.state() != ConnectionState::Closed && conn.idle_for() >= keep_alive
            })
            .map(|(url, _)| url.clone())
            .collect();
        for url in candidates {
            let in_use = self.live_subscriptions().iter().any(|sub| sub.serves(&url))
                || self.publisher.has_pending(&url);
            if in_use {
                continue;
            }
            info!("Disconnecting idle relay {} after {:?}", url, keep_alive);
            PoolStats::incr(&self.stats.idle_disconnects);
            self.drop_relay(&url);
        }
    }

    fn connection(&self, url: &RelayUrl) -> Option<Arc<RelayConnection>> {
        self.relays.read().get(url).cloned()
    }

    fn subscription(&self, id: &str) -> Option<Arc<SubscriptionInner>> {
        self.subscriptions.read().get(id).cloned()
    }

    fn live_subscriptions(&self) -> Vec<Arc<SubscriptionInner>> {
        self.subscriptions.read().values().cloned().collect()
    }

    fn publish_notice(&self, relay_url: &RelayUrl, kind: NoticeKind, message: String) {
        self.notices.publish(Notice {
            relay_url: relay_url.clone(),
            message,
            kind,
        });
    }

    fn on_notification(&self, url: &RelayUrl, notification: RelayNotification) {
        match notification {
            RelayNotification::Opened => self.on_opened(url),
            RelayNotification::Disconnected { reason } => {
                for sub in self.live_subscriptions() {
                    sub.reset_req(url);
                }
                self.publish_notice(url, NoticeKind::ConnectionError, reason);
            }
            RelayNotification::ConnectFailed { error, retry_in } => {
                let message = match retry_in {
                    Some(delay) => format!("{} (retrying in {:?})", error, delay),
                    None => format!("{} (giving up)", error),
                };
                self.publish_notice(url, NoticeKind::ConnectionError, message);
            }
            RelayNotification::Message(message) => self.on_message(url, message),
            RelayNotification::DecodeError { raw, error } => {
                PoolStats::incr(&self.stats.decode_errors);
                let quoted: String = raw.chars().take(MAX_QUOTED_FRAME).collect();
                self.publish_notice(
                    url,
                    NoticeKind::ProtocolError,
                    format!("{}: {}", error, quoted),
                );
            }
            RelayNotification::Closed => self.on_relay_closed(url),
        }
    }

    /// A connection still registered here went terminal on its own: connect
    /// or session failure without auto-reconnect. `drop_relay` and shutdown
    /// unregister a connection before closing it, so they never get here.
    fn on_relay_closed(&self, url: &RelayUrl) {
        let Some(conn) = self
            .connection(url)
            .filter(|conn| conn.state() == ConnectionState::Closed)
        else {
            debug!("Relay {} reported closed", url);
            return;
        };
        let reason = conn
            .last_error()
            .unwrap_or_else(|| format!("Relay {} closed", url));
        warn!("Lost relay {} for good: {}", url, reason);
        self.detach_relay(url, &reason, ClientError::NotConnected);
    }

    /// Stop counting on `url`: every subscription drops it, and publishes
    /// waiting on it fail with `error`.
    fn detach_relay(&self, url: &RelayUrl, reason: &str, error: ClientError) {
        for sub in self.live_subscriptions() {
            if sub.remove_relay(url, reason.to_string()) {
                self.subscriptions.write().remove(sub.id());
            }
        }
        self.publisher.fail_relay(url, error);
    }

    /// (Re)issue REQ for every live subscription that targets the relay.
    fn on_opened(&self, url: &RelayUrl) {
        let Some(conn) = self.connection(url) else {
            return;
        };
        for sub in self.live_subscriptions() {
            if !sub.claim_req(url) {
                continue;
            }
            debug!("Sending REQ {} to {}", sub.id(), url);
            if let Err(error) = conn.send_text(sub.req_frame().to_string()) {
                warn!("Failed to send REQ {} to {}: {}", sub.id(), url, error);
            }
        }
    }

    fn on_message(&self, url: &RelayUrl, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => match self.subscription(&subscription_id) {
                Some(sub) => {
                    if sub.handle_event(url, event) == EventOutcome::Ignored {
                        debug!("Ignored event for {} from {}", subscription_id, url);
                    }
                }
                None => debug!(
                    "Event for unknown subscription {} from {}",
                    subscription_id, url
                ),
            },
            RelayMessage::Eose { subscription_id } => {
                if let Some(sub) = self.subscription(&subscription_id) {
                    sub.handle_eose(url);
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                warn!(
                    "Relay {} closed subscription {}: {}",
                    url, subscription_id, message
                );
                if let Some(sub) = self.subscription(&subscription_id)
                    && sub.remove_relay(url, message)
                {
                    self.subscriptions.write().remove(&subscription_id);
                }
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                debug!("OK from {} for {}: {} {}", url, event_id, success, message);
                let ack = RelayAck {
                    accepted: success,
                    message: (!message.is_empty()).then_some(message),
                };
                self.publisher.resolve(url, &event_id, ack);
            }
            RelayMessage::Notice { message } => {
                info!("Notice from {}: {}", url, message);
                for sub in self.live_subscriptions() {
                    sub.handle_notice(url, &message);
                }
                self.publish_notice(url, NoticeKind::Relay, message);
            }
        }
    }

    /// Close a subscription and tell the relays still serving it.
    pub(crate) fn unsubscribe(&self, sub: &Arc<SubscriptionInner>) {
        self.subscriptions.write().remove(sub.id());
        let Some(served) = sub.close(None) else {
            debug!("Subscription {} already closed", sub.id());
            return;
        };
        let frame = match sub.close_frame() {
            Ok(frame) => frame,
            Err(error) => {
                warn!("Failed to encode CLOSE for {}: {}", sub.id(), error);
                return;
            }
        };
        for url in served {
            if let Some(conn) = self.connection(&url)
                && conn.is_open()
                && let Err(error) = conn.send_text(frame.clone())
            {
                debug!("Failed to send CLOSE {} to {}: {}", sub.id(), url, error);
            }
        }
    }

    async fn await_ack(
        &self,
        url: RelayUrl,
        event_id: &str,
        ack: oneshot::Receiver<Result<RelayAck>>,
    ) -> (RelayUrl, Result<RelayAck>) {
        let publish_timeout = self.config.publish_timeout;
        let result = match tokio::time::timeout(publish_timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::PoolClosed),
            Err(_) => {
                PoolStats::incr(&self.stats.publish_timeouts);
                warn!("No OK from {} for {} within {:?}", url, event_id, publish_timeout);
                self.publisher.forget(&url, event_id);
                Err(ClientError::PublishTimeout(publish_timeout))
            }
        };
        (url, result)
    }

    fn drop_relay(&self, url: &RelayUrl) {
        let Some(conn) = self.relays.write().remove(url) else {
            return;
        };
        info!("Removing relay from pool: {}", url);
        self.detach_relay(url, &ClientError::PoolClosed.to_string(), ClientError::PoolClosed);
        conn.close();
    }

    /// Close every subscription and relay. False when already shut down.
    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Closing relay pool");
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }

        let subs: Vec<Arc<SubscriptionInner>> = self
            .subscriptions
            .write()
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for sub in subs {
            sub.close(Some(ClientError::PoolClosed.to_string()));
        }

        let relays: Vec<Arc<RelayConnection>> =
            self.relays.write().drain().map(|(_, conn)| conn).collect();
        self.publisher.fail_all(ClientError::PoolClosed);
        for conn in relays {
            conn.close();
        }
        true
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if self.shutdown() {
            debug!("Relay pool dropped without close_all");
        }
    }
}

/// A pool of Nostr relay connections.
///
/// Cloning is cheap and every clone drives the same pool.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Pool over WebSocket connections, verifying Schnorr signatures.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_transport(
            config,
            Arc::new(WebSocketTransport),
            Arc::new(SchnorrVerifier::new()),
        )
    }

    /// Pool over a custom transport and verifier.
    pub fn with_transport(
        config: PoolConfig,
        transport: Arc<dyn Transport>,
        verifier: Arc<dyn EventVerifier>,
    ) -> Self {
        let notices = NoticeBus::new(config.notice_capacity);
        let inner = Arc::new_cyclic(|this| PoolInner {
            config,
            transport,
            verifier,
            relays: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            ids: SubscriptionIdGenerator::new(),
            publisher: Publisher::default(),
            notices,
            stats: Arc::new(PoolStats::default()),
            closed: AtomicBool::new(false),
            reaper: Mutex::new(None),
            this: this.clone(),
        });
        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Register a relay and start connecting to it. Idempotent.
    ///
    /// Must be called within a Tokio runtime.
    pub fn connect_relay(&self, url: &str) -> Result<RelayUrl> {
        self.inner.ensure_open()?;
        let url = RelayUrl::parse(url)?;
        self.inner.ensure_relay(&url);
        Ok(url)
    }

    /// Wait until `url` is open.
    pub async fn wait_connected(&self, url: &str, wait: Duration) -> Result<()> {
        let url = RelayUrl::parse(url)?;
        let conn = self
            .inner
            .connection(&url)
            .ok_or(ClientError::NotConnected)?;
        let mut states = conn.state_changes();
        let opened = tokio::time::timeout(wait, async {
            loop {
                match *states.borrow_and_update() {
                    ConnectionState::Open => return Ok(()),
                    ConnectionState::Closing | ConnectionState::Closed => {
                        return Err(ClientError::NotConnected);
                    }
                    _ => {}
                }
                if states.changed().await.is_err() {
                    return Err(ClientError::NotConnected);
                }
            }
        })
        .await;
        opened.unwrap_or(Err(ClientError::ConnectTimeout(wait)))
    }

    /// Send an event to every relay in `relays` and collect their OK frames.
    ///
    /// Never fails because of a single relay: per-relay failures (timeout,
    /// not connected, pool closed) are reported in the outcome.
    pub async fn publish<I, S>(&self, relays: I, event: &Event) -> Result<PublishOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.ensure_open()?;
        let urls = parse_relays(relays)?;
        if urls.is_empty() {
            return Err(ClientError::InvalidRequest(
                "publish needs at least one relay".to_string(),
            ));
        }
        let frame = ClientMessage::Event(event.clone()).to_json()?;
        info!("Publishing event {} to {} relays", event.id, urls.len());

        let mut results = HashMap::new();
        let mut waits = Vec::new();
        for url in urls {
            let conn = self.inner.ensure_relay(&url);
            // Registered before sending so a fast OK cannot be missed.
            let ack = self.inner.publisher.register(&url, &event.id);
            match conn.send_text(frame.clone()) {
                Ok(()) => waits.push(self.inner.await_ack(url, &event.id, ack)),
                Err(error) => {
                    drop(ack);
                    self.inner.publisher.forget(&url, &event.id);
                    results.insert(url, Err(error));
                }
            }
        }
        results.extend(join_all(waits).await);

        Ok(PublishOutcome {
            event_id: event.id.clone(),
            results,
        })
    }

    /// Create a subscription on `relays`.
    ///
    /// REQ goes out immediately to relays that are open and on (re)connect to
    /// the others. Nothing is delivered until [`Subscription::open`] is called.
    /// Every distinct event is delivered once.
    pub fn subscribe<I, S>(&self, filters: Vec<Filter>, relays: I) -> Result<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.subscribe_with_tracker(filters, relays, EventDeduplicator::new())
    }

    /// [`subscribe`](Self::subscribe) with a custom duplicate tracker, e.g. a
    /// bounded [`SlidingWindowTracker`](crate::SlidingWindowTracker) for a
    /// long-lived feed.
    pub fn subscribe_with_tracker<I, S>(
        &self,
        filters: Vec<Filter>,
        relays: I,
        tracker: impl EventTracker + 'static,
    ) -> Result<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.ensure_open()?;
        if filters.is_empty() {
            return Err(ClientError::InvalidRequest(
                "subscription needs at least one filter".to_string(),
            ));
        }
        let urls = parse_relays(relays)?;
        if urls.is_empty() {
            return Err(ClientError::InvalidRequest(
                "subscription needs at least one relay".to_string(),
            ));
        }

        let id = self.inner.ids.next_id();
        let sub = SubscriptionInner::new(
            id.clone(),
            filters,
            urls.clone(),
            Arc::clone(&self.inner.verifier),
            Arc::clone(&self.inner.stats),
            self.inner.config.eose_timeout,
            Box::new(tracker),
        )?;
        // Registered before any REQ so no early frame is lost.
        self.inner
            .subscriptions
            .write()
            .insert(id.clone(), Arc::clone(&sub));
        info!("Subscribing {} on {} relays", id, urls.len());

        for url in &urls {
            let conn = self.inner.ensure_relay(url);
            // Relays that open later get REQ from the Opened notification.
            if conn.is_open()
                && sub.claim_req(url)
                && let Err(error) = conn.send_text(sub.req_frame().to_string())
            {
                debug!("REQ {} to {} deferred: {}", id, url, error);
            }
        }

        Ok(Subscription::new(sub, Arc::downgrade(&self.inner)))
    }

    /// Close a subscription. Idempotent; the close listeners fire once.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.unsubscribe(subscription.inner());
    }

    /// Close every live subscription. The pool stays usable.
    pub fn unsubscribe_all(&self) {
        let subs = self.inner.live_subscriptions();
        info!("Unsubscribing {} subscriptions", subs.len());
        for sub in subs {
            self.inner.unsubscribe(&sub);
        }
    }

    /// One-shot query: subscribe, collect until `policy` is met, the
    /// subscription is closed by its relays, or `wait` elapses; then
    /// unsubscribe. Events come back newest first.
    pub async fn fetch<I, S>(
        &self,
        filters: Vec<Filter>,
        relays: I,
        policy: FetchPolicy,
        wait: Duration,
    ) -> Result<Vec<Arc<Event>>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sub = self.subscribe(filters, relays)?;
        let (collector, done) = FetchCollector::new(policy);
        sub.add_listener(Arc::clone(&collector) as Arc<dyn SubscriptionListener>)
            .open();

        if tokio::time::timeout(wait, done).await.is_err() {
            debug!("Fetch {} timed out after {:?}", sub.id(), wait);
        }
        self.unsubscribe(&sub);

        let mut events = collector.take_events();
        sort_events(&mut events);
        Ok(events)
    }

    /// Drop relays from the pool. Pending publishes on them fail with
    /// `PoolClosed` and subscriptions stop counting on them.
    pub fn close<I, S>(&self, relays: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for url in parse_relays(relays)? {
            self.inner.drop_relay(&url);
        }
        Ok(())
    }

    /// Shut the pool down: every subscription closes, every relay
    /// disconnects, and later calls fail with `PoolClosed`. Idempotent.
    /// Dropping the last handle of a pool does the same.
    pub fn close_all(&self) {
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Register a callback for every notice. Runs on the task that produced
    /// the notice; panics are logged and swallowed.
    pub fn add_notice_listener(
        &self,
        listener: impl Fn(&Notice) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.notices.add_listener(listener)
    }

    pub fn remove_notice_listener(&self, id: ListenerId) -> bool {
        self.inner.notices.remove_listener(id)
    }

    /// Receive notices as a stream.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    /// Get all relay URLs in the pool, sorted.
    pub fn relay_urls(&self) -> Vec<RelayUrl> {
        let mut urls: Vec<RelayUrl> = self.inner.relays.read().keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn relay_state(&self, url: &str) -> Option<ConnectionState> {
        let url = RelayUrl::parse(url).ok()?;
        self.inner.connection(&url).map(|conn| conn.state())
    }

    /// Get connection states for all relays.
    pub fn states(&self) -> HashMap<RelayUrl, ConnectionState> {
        self.inner
            .relays
            .read()
            .iter()
            .map(|(url, conn)| (url.clone(), conn.state()))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.inner
            .relays
            .read()
            .values()
            .filter(|conn| conn.is_open())
            .count()
    }

    /// Ids of subscriptions that are not closed.
    pub fn subscription_ids(&self) -> Vec<String> {
        self.inner.subscriptions.read().keys().cloned().collect()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.relay_urls())
            .field("subscriptions", &self.inner.subscriptions.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
