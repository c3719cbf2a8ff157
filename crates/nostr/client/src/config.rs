//! Relay and pool configuration.
//!
//! Durations are (de)serialized as integer milliseconds. `PoolConfig::from_env`
//! layers `NOSTR_POOL_*` environment variables over the defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

pub const ENV_CONNECT_TIMEOUT_MS: &str = "NOSTR_POOL_CONNECT_TIMEOUT_MS";
pub const ENV_PUBLISH_TIMEOUT_MS: &str = "NOSTR_POOL_PUBLISH_TIMEOUT_MS";
pub const ENV_EOSE_TIMEOUT_MS: &str = "NOSTR_POOL_EOSE_TIMEOUT_MS";
pub const ENV_AUTO_RECONNECT: &str = "NOSTR_POOL_AUTO_RECONNECT";
pub const ENV_KEEP_ALIVE_MS: &str = "NOSTR_POOL_KEEP_ALIVE_MS";

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => s.serialize_some(&(d.as_millis().min(u64::MAX as u128) as u64)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
        }
    }
}

/// Per-relay connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// Upper bound on a single connection attempt
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// First reconnect delay
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,
    /// Reconnect delay cap
    #[serde(with = "duration_ms")]
    pub max_reconnect_delay: Duration,
    /// Reconnect after failures and remote disconnects
    pub auto_reconnect: bool,
    /// Frames held while a connection is (re)establishing; oldest dropped first
    pub max_queued_frames: usize,
    /// A relay serving no subscription and silent for this long is
    /// disconnected by its pool. `None` keeps idle relays connected.
    #[serde(with = "duration_ms::option")]
    pub keep_alive: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(120),
            auto_reconnect: true,
            max_queued_frames: 1024,
            keep_alive: Some(Duration::from_secs(120)),
        }
    }
}

/// Relay pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    /// Applied to every relay the pool opens
    pub relay: RelayConfig,
    /// Per-relay wait for an OK frame after publishing
    #[serde(with = "duration_ms")]
    pub publish_timeout: Duration,
    /// Relays that have not sent EOSE this long after a subscription opens
    /// stop counting towards aggregate EOSE
    #[serde(with = "duration_ms::option")]
    pub eose_timeout: Option<Duration>,
    /// Capacity of the broadcast channel behind `RelayPool::notices`
    pub notice_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            publish_timeout: Duration::from_secs(10),
            eose_timeout: None,
            notice_capacity: 256,
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `NOSTR_POOL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the
    /// `NOSTR_POOL_*` keys. Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let millis = |key: &str| -> Option<Duration> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(_) => {
                    warn!("Ignoring {}={:?}: expected milliseconds", key, raw);
                    None
                }
            }
        };

        if let Some(timeout) = millis(ENV_CONNECT_TIMEOUT_MS) {
            config.relay.connect_timeout = timeout;
        }
        if let Some(timeout) = millis(ENV_PUBLISH_TIMEOUT_MS) {
            config.publish_timeout = timeout;
        }
        if let Some(timeout) = millis(ENV_EOSE_TIMEOUT_MS) {
            config.eose_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(keep_alive) = millis(ENV_KEEP_ALIVE_MS) {
            config.relay.keep_alive = (!keep_alive.is_zero()).then_some(keep_alive);
        }
        if let Some(raw) = lookup(ENV_AUTO_RECONNECT) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.relay.auto_reconnect = true,
                "0" | "false" | "no" | "off" => config.relay.auto_reconnect = false,
                _ => warn!("Ignoring {}={:?}: expected a boolean", ENV_AUTO_RECONNECT, raw),
            }
        }
        config
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_eose_timeout(mut self, timeout: Duration) -> Self {
        self.eose_timeout = Some(timeout);
        self
    }

    pub fn with_relay_config(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }
}
