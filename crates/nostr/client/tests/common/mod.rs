//! In-memory relays for driving a `RelayPool` without sockets.

#![allow(dead_code)]

use async_trait::async_trait;
use nostr::{Event, EventTemplate, Keys, Sha256Hasher, sign_event};
use nostr_client::{
    ClientError, PoolConfig, RelayConfig, RelayPool, RelayUrl, Result, Transport,
    TransportConnection, TransportEvent, TransportSink,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// One scripted relay. Frames the client sends are recorded; frames the
/// relay "sends" are pushed into the live session.
#[derive(Default)]
pub struct MockRelay {
    sent: Mutex<Vec<String>>,
    session: Mutex<Option<(u64, mpsc::UnboundedSender<TransportEvent>)>>,
    sessions: AtomicU64,
    connects: AtomicUsize,
    refuse: AtomicBool,
}

impl MockRelay {
    /// Fail every connection attempt until called with `false`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Sent frames of one type (`"REQ"`, `"EVENT"`, `"CLOSE"`), decoded.
    pub fn sent_of(&self, kind: &str) -> Vec<Vec<Value>> {
        self.sent
            .lock()
            .iter()
            .filter_map(|raw| serde_json::from_str::<Vec<Value>>(raw).ok())
            .filter(|frame| frame.first().and_then(Value::as_str) == Some(kind))
            .collect()
    }

    pub fn emit(&self, frame: impl Into<String>) {
        let session = self.session.lock();
        let (_, tx) = session.as_ref().expect("relay has no live session");
        tx.send(TransportEvent::Text(frame.into()))
            .expect("session reader dropped");
    }

    pub fn emit_event(&self, subscription_id: &str, event: &Event) {
        let frame = serde_json::json!(["EVENT", subscription_id, event]);
        self.emit(frame.to_string());
    }

    pub fn emit_eose(&self, subscription_id: &str) {
        self.emit(serde_json::json!(["EOSE", subscription_id]).to_string());
    }

    pub fn emit_closed(&self, subscription_id: &str, message: &str) {
        self.emit(serde_json::json!(["CLOSED", subscription_id, message]).to_string());
    }

    pub fn emit_notice(&self, message: &str) {
        self.emit(serde_json::json!(["NOTICE", message]).to_string());
    }

    pub fn emit_ok(&self, event_id: &str, accepted: bool, message: &str) {
        self.emit(serde_json::json!(["OK", event_id, accepted, message]).to_string());
    }

    /// The relay drops the socket.
    pub fn drop_connection(&self) {
        if let Some((_, tx)) = self.session.lock().take() {
            let _ = tx.send(TransportEvent::Closed(Some("connection reset".to_string())));
        }
    }
}

struct MockSink {
    relay: Arc<MockRelay>,
    session: u64,
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send(&mut self, text: String) -> Result<()> {
        let live = matches!(&*self.relay.session.lock(), Some((id, _)) if *id == self.session);
        if !live {
            return Err(ClientError::Transport("socket closed".to_string()));
        }
        self.relay.sent.lock().push(text);
        Ok(())
    }

    async fn close(&mut self) {
        let mut session = self.relay.session.lock();
        if matches!(&*session, Some((id, _)) if *id == self.session) {
            *session = None;
        }
    }
}

#[derive(Default)]
pub struct MockTransport {
    relays: Mutex<HashMap<RelayUrl, Arc<MockRelay>>>,
}

impl MockTransport {
    pub fn relay(&self, url: &str) -> Arc<MockRelay> {
        let url = RelayUrl::parse(url).expect("valid relay url");
        Arc::clone(self.relays.lock().entry(url).or_default())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &RelayUrl) -> Result<TransportConnection> {
        let relay = self.relay(url.as_str());
        relay.connects.fetch_add(1, Ordering::SeqCst);
        if relay.refuse.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("connection refused".to_string()));
        }

        let session = relay.sessions.fetch_add(1, Ordering::SeqCst);
        let (tx, inbound) = mpsc::unbounded_channel();
        *relay.session.lock() = Some((session, tx));
        Ok(TransportConnection {
            sink: Box::new(MockSink {
                relay: Arc::clone(&relay),
                session,
            }),
            inbound,
        })
    }
}

pub fn test_config() -> PoolConfig {
    PoolConfig::default()
        .with_publish_timeout(Duration::from_secs(1))
        .with_relay_config(RelayConfig {
            connect_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(50),
            ..RelayConfig::default()
        })
}

pub fn mock_pool(config: PoolConfig) -> (RelayPool, Arc<MockTransport>) {
    init_tracing();
    let transport = Arc::new(MockTransport::default());
    let pool = RelayPool::with_transport(
        config,
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(nostr::SchnorrVerifier::new()),
    );
    (pool, transport)
}

pub fn note(keys: &Keys, created_at: u64, content: &str) -> Event {
    signed(keys, 1, created_at, content)
}

pub fn signed(keys: &Keys, kind: u16, created_at: u64, content: &str) -> Event {
    let template = EventTemplate {
        created_at,
        kind,
        tags: vec![],
        content: content.to_string(),
    };
    sign_event(&template, keys, &Sha256Hasher).expect("signing succeeds")
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Let spawned tasks drain without waiting for anything in particular.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}
