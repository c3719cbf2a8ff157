//! Per-subscription event deduplication.
//!
//! A subscription asks its [`EventTracker`] about every verified, matching
//! event before delivering it. Only verified events ever reach a tracker, so
//! a forged copy arriving first can never shadow the genuine one.

use crate::filter::Filter;
use nostr::Event;
use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Decides which events a subscription has already delivered.
pub trait EventTracker: Send {
    /// True when `event` must be dropped as already seen. Otherwise the event
    /// is recorded and false is returned.
    fn seen(&mut self, event: &Event) -> bool;

    /// Adjust to the filters of the subscription that owns this tracker.
    fn tune_for(&mut self, _filters: &[Filter]) {}
}

/// Remembers every event id a subscription has delivered.
///
/// Exact, and grows with the number of distinct events. This is the
/// tracker a plain `subscribe` uses.
#[derive(Debug, Default)]
pub struct EventDeduplicator {
    seen: HashSet<String>,
}

impl EventDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once per id over the lifetime of this deduplicator.
    pub fn observe(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen = HashSet::new();
    }
}

impl EventTracker for EventDeduplicator {
    fn seen(&mut self, event: &Event) -> bool {
        !self.observe(&event.id)
    }
}

/// Delivers everything, duplicates included.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTracker;

impl EventTracker for PassthroughTracker {
    fn seen(&mut self, _event: &Event) -> bool {
        false
    }
}

/// Bounded tracker for long-lived feeds.
///
/// Keeps at most `max_tracked` ids, oldest `created_at` evicted first, and
/// maintains a cutoff timestamp: anything created before it is treated as
/// seen. Once more than `min_tracked` ids are held, the cutoff slides forward
/// whenever it falls more than `window` behind the clock, to `window - margin`
/// before now. Evicted ids that show up again at or after the cutoff are
/// delivered again.
#[derive(Debug)]
pub struct SlidingWindowTracker {
    by_age: BTreeSet<(u64, String)>,
    ids: HashSet<String>,
    max_tracked: usize,
    min_tracked: usize,
    window: u64,
    margin: u64,
    cutoff: u64,
}

impl SlidingWindowTracker {
    pub fn new(max_tracked: usize, min_tracked: usize, window: Duration, margin: Duration) -> Self {
        Self {
            by_age: BTreeSet::new(),
            ids: HashSet::new(),
            max_tracked: max_tracked.max(1),
            min_tracked,
            window: window.as_secs(),
            margin: margin.as_secs().min(window.as_secs()),
            cutoff: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Events created before this unix timestamp are dropped.
    pub fn cutoff(&self) -> u64 {
        self.cutoff
    }

    fn seen_at(&mut self, event: &Event, now: u64) -> bool {
        if event.created_at < self.cutoff || self.ids.contains(&event.id) {
            return true;
        }
        self.ids.insert(event.id.clone());
        self.by_age.insert((event.created_at, event.id.clone()));
        self.evict(now);
        false
    }

    fn evict(&mut self, now: u64) {
        if self.ids.len() <= self.min_tracked {
            return;
        }
        let over = self.ids.len().saturating_sub(self.max_tracked);

        let slide = now.saturating_sub(self.cutoff) > self.window;
        if slide {
            self.cutoff = now.saturating_sub(self.window - self.margin);
        }

        let mut removed = 0;
        while let Some((created_at, _)) = self.by_age.first() {
            let expired = slide && *created_at < self.cutoff;
            if !expired && removed >= over {
                break;
            }
            if let Some((_, id)) = self.by_age.pop_first() {
                self.ids.remove(&id);
                removed += 1;
            }
        }

        if over > 0
            && let Some((oldest, _)) = self.by_age.first()
        {
            self.cutoff = self.cutoff.max(*oldest);
        }
    }
}

impl Default for SlidingWindowTracker {
    /// Unbounded count, 21 ids minimum, one hour window, 30 minute margin.
    fn default() -> Self {
        Self::new(
            usize::MAX,
            21,
            Duration::from_secs(60 * 60),
            Duration::from_secs(30 * 60),
        )
    }
}

impl EventTracker for SlidingWindowTracker {
    fn seen(&mut self, event: &Event) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.seen_at(event, now)
    }

    /// Track twice the largest `limit`, and never accept events older than
    /// the earliest `since`.
    fn tune_for(&mut self, filters: &[Filter]) {
        if let Some(limit) = filters.iter().filter_map(|f| f.limit).max()
            && limit > 0
        {
            self.max_tracked = usize::try_from(limit.saturating_mul(2)).unwrap_or(usize::MAX);
        }
        if let Some(since) = filters.iter().filter_map(|f| f.since).min() {
            self.cutoff = self.cutoff.max(since);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "pubkey".to_string(),
            created_at,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn test_observe_once() {
        let mut dedup = EventDeduplicator::new();
        assert!(dedup.observe("e1"));
        assert!(!dedup.observe("e1"));
        assert!(dedup.observe("e2"));
        assert_eq!(dedup.len(), 2);
        assert!(dedup.contains("e1"));
        assert!(dedup.seen(&event("e2", 0)));
        assert!(!dedup.seen(&event("e3", 0)));
    }

    #[test]
    fn test_clear_releases_ids() {
        let mut dedup = EventDeduplicator::new();
        dedup.observe("e1");
        dedup.clear();
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_passthrough_never_drops() {
        let mut tracker = PassthroughTracker;
        assert!(!tracker.seen(&event("e1", 0)));
        assert!(!tracker.seen(&event("e1", 0)));
    }

    #[test]
    fn test_sliding_window_caps_tracked_ids() {
        let now = 1_700_000_000;
        let mut tracker =
            SlidingWindowTracker::new(3, 0, Duration::from_secs(3600), Duration::from_secs(1800));
        tracker.cutoff = now - 100;

        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            assert!(!tracker.seen_at(&event(id, now - 50 + i as u64), now));
        }
        assert_eq!(tracker.len(), 3);
        // "a" was evicted and the cutoff moved up to the oldest kept event.
        assert_eq!(tracker.cutoff(), now - 49);
        assert!(tracker.seen_at(&event("a", now - 50), now));
        assert!(tracker.seen_at(&event("d", now - 47), now));
        assert!(!tracker.seen_at(&event("e", now), now));
    }

    #[test]
    fn test_sliding_window_drops_events_behind_window() {
        let now = 1_700_000_000;
        let mut tracker =
            SlidingWindowTracker::new(100, 1, Duration::from_secs(3600), Duration::from_secs(1800));

        assert!(!tracker.seen_at(&event("old", now - 7200), now));
        // Second id exceeds min_tracked: the window slides and "old" falls out.
        assert!(!tracker.seen_at(&event("new", now - 10), now));
        assert_eq!(tracker.cutoff(), now - 1800);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.seen_at(&event("older", now - 3600), now));
        assert!(tracker.seen_at(&event("new", now - 10), now));
    }

    #[test]
    fn test_sliding_window_tunes_for_filters() {
        let mut tracker = SlidingWindowTracker::default();
        tracker.tune_for(&[
            Filter::new().limit(10).since(1_000),
            Filter::new().limit(25).since(2_000),
        ]);
        assert_eq!(tracker.max_tracked, 50);
        assert_eq!(tracker.cutoff(), 1_000);
        assert!(tracker.seen(&event("early", 999)));
    }
}
