//! Multi-relay Nostr client for OpenAgents.
//!
//! This crate provides:
//! - One long-lived connection per relay, with queued sends and reconnect backoff
//! - NIP-01 message encoding and decoding
//! - Subscriptions spanning several relays, with signature verification,
//!   pluggable per-subscription deduplication and aggregate EOSE
//! - One-shot fetches that end on aggregate EOSE or after enough events
//! - Publishing to several relays with per-relay OK tracking
//! - A pool-wide notice bus for relay notices and connection diagnostics
//! - Idle relays dropped after a keep-alive period and reconnected on demand
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_client::{Filter, PoolConfig, RelayPool};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = RelayPool::new(PoolConfig::from_env());
//!     let relays = ["wss://relay.damus.io", "wss://nos.lol"];
//!
//!     // Subscribe to kind 1 (text notes)
//!     let filter = Filter::new().kinds([1]).limit(10);
//!     let sub = pool.subscribe(vec![filter], relays).unwrap();
//!     sub.add_event_listener(|event, relay, _stored| {
//!         println!("{} from {}", event.id, relay);
//!     })
//!     .add_eose_listener(|_, all| {
//!         if all {
//!             println!("Got all stored events");
//!         }
//!     })
//!     .open();
//!
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     sub.unsubscribe();
//!     pool.close_all();
//! }
//! ```

mod backoff;
mod config;
mod dedup;
mod error;
mod fetch;
mod filter;
mod message;
mod notice;
mod pool;
mod publisher;
mod relay;
mod relay_url;
mod stats;
mod subscription;
mod transport;

// Re-export main types
pub use config::{
    ENV_AUTO_RECONNECT, ENV_CONNECT_TIMEOUT_MS, ENV_EOSE_TIMEOUT_MS, ENV_KEEP_ALIVE_MS,
    ENV_PUBLISH_TIMEOUT_MS, PoolConfig, RelayConfig,
};
pub use dedup::{EventDeduplicator, EventTracker, PassthroughTracker, SlidingWindowTracker};
pub use error::{ClientError, Result};
pub use fetch::{EventPredicate, FetchPolicy};
pub use filter::{Filter, matches_any};
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use notice::{ListenerId, Notice, NoticeBus, NoticeKind, NoticeListener};
pub use pool::RelayPool;
pub use publisher::{AckPolicy, PublishOutcome, RelayAck};
pub use relay::{ConnectionState, NotificationHandler, RelayConnection, RelayNotification};
pub use relay_url::RelayUrl;
pub use stats::StatsSnapshot;
pub use subscription::{Subscription, SubscriptionListener, SubscriptionState};
pub use transport::{
    Transport, TransportConnection, TransportEvent, TransportSink, WebSocketTransport,
};

/// Default relays for OpenAgents.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];

/// Create a relay pool and start connecting to the default OpenAgents relays.
///
/// Must be called within a Tokio runtime.
pub fn default_pool() -> Result<RelayPool> {
    let pool = RelayPool::new(PoolConfig::from_env());
    for relay in DEFAULT_RELAYS {
        pool.connect_relay(relay)?;
    }
    Ok(pool)
}
