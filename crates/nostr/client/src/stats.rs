//! Pool counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct PoolStats {
    pub(crate) events_delivered: AtomicU64,
    pub(crate) duplicates_suppressed: AtomicU64,
    pub(crate) verification_failures: AtomicU64,
    pub(crate) filter_mismatches: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) publish_timeouts: AtomicU64,
    pub(crate) idle_disconnects: AtomicU64,
}

impl PoolStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            verification_failures: self.verification_failures.load(Ordering::Relaxed),
            filter_mismatches: self.filter_mismatches.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            publish_timeouts: self.publish_timeouts.load(Ordering::Relaxed),
            idle_disconnects: self.idle_disconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Events handed to subscription listeners
    pub events_delivered: u64,
    /// Verified events dropped because the subscription already had them
    pub duplicates_suppressed: u64,
    /// Events dropped because verification failed
    pub verification_failures: u64,
    /// Verified events that matched none of the subscription's filters
    pub filter_mismatches: u64,
    /// Inbound frames that could not be decoded
    pub decode_errors: u64,
    /// Per-relay publish results that timed out
    pub publish_timeouts: u64,
    /// Relays disconnected after sitting idle past their keep-alive
    pub idle_disconnects: u64,
}
