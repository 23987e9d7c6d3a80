//! Fixed-window request counter.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace};

use super::key::CounterKey;

/// Outcome of a single window counter check.
///
/// Carries everything a caller needs to emit the standard rate limit headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    /// Whether the request fits in the current window
    pub allowed: bool,
    /// The configured quota for the window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Whole seconds until the window resets (rounded up)
    pub reset_in_secs: u64,
}

/// Per-key state for a fixed window.
#[derive(Debug, Clone, Copy)]
pub struct CounterEntry {
    /// Requests seen since the window opened
    pub count: u64,
    /// When the current window closes
    pub window_reset_at: DateTime<Utc>,
    /// Length of the window this entry was opened with
    pub window: Duration,
}

impl CounterEntry {
    fn open(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 1,
            window_reset_at: now + chrono_duration(window),
            window,
        }
    }

    /// True once the sweeper may drop the entry: one full window past reset.
    fn is_evictable(&self, now: DateTime<Utc>) -> bool {
        now > self.window_reset_at + chrono_duration(self.window)
    }
}

/// A fixed-window counter store keyed by `(policy, identifier)`.
///
/// Read-modify-write on an entry runs under the owning shard's write lock,
/// so concurrent checks for the same key never lose an increment.
pub struct WindowCounter {
    entries: DashMap<CounterKey, CounterEntry>,
}

impl WindowCounter {
    /// Create an empty counter store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Count a request against `policy` for `identifier`.
    pub fn check(&self, policy: &str, identifier: &str, window: Duration, limit: u64) -> RateLimitStatus {
        self.check_at(policy, identifier, window, limit, Utc::now())
    }

    /// Count a request observed at `now`.
    ///
    /// A missing or expired entry is replaced by a fresh window holding this
    /// request; otherwise the stored count is incremented.
    pub fn check_at(
        &self,
        policy: &str,
        identifier: &str,
        window: Duration,
        limit: u64,
        now: DateTime<Utc>,
    ) -> RateLimitStatus {
        let key = CounterKey::new(policy, identifier);

        trace!(key = %key, limit, "Checking window counter");

        let entry = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if now > occupied.get().window_reset_at {
                    debug!(key = %occupied.key(), "Window expired, opening a new one");
                    occupied.insert(CounterEntry::open(now, window));
                } else {
                    let current = occupied.get_mut();
                    current.count = current.count.saturating_add(1);
                }
                *occupied.get()
            }
            Entry::Vacant(vacant) => *vacant.insert(CounterEntry::open(now, window)),
        };

        let allowed = entry.count <= limit;
        let mut reset_in_secs = seconds_until(entry.window_reset_at, now);
        if !allowed {
            // A new window opens strictly after the reset instant.
            reset_in_secs = reset_in_secs.max(1);
            debug!(
                policy,
                identifier,
                count = entry.count,
                limit,
                "Rate limit exceeded"
            );
        }

        RateLimitStatus {
            allowed,
            limit,
            remaining: limit.saturating_sub(entry.count),
            reset_in_secs,
        }
    }

    /// Get the current count for a key, if a window is open.
    pub fn current_count(&self, policy: &str, identifier: &str) -> Option<u64> {
        self.entries
            .get(&CounterKey::new(policy, identifier))
            .map(|entry| entry.count)
    }

    /// Drop every entry that is at least one window past its reset time.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_evictable(now));
        before.saturating_sub(self.entries.len())
    }

    /// Get the number of tracked counters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no counters are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for WindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a std duration, capped so timestamp arithmetic cannot overflow.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    let cap = chrono::Duration::weeks(52 * 100);
    chrono::Duration::from_std(duration).map_or(cap, |d| d.min(cap))
}

/// Whole seconds from `now` until `deadline`, rounded up, zero if passed.
pub(crate) fn seconds_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (deadline - now).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        (millis as u64).div_ceil(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_first_request_opens_window() {
        let counter = WindowCounter::new();
        let now = Utc::now();

        let status = counter.check_at("api", "1.2.3.4", MINUTE, 10, now);

        assert!(status.allowed);
        assert_eq!(status.limit, 10);
        assert_eq!(status.remaining, 9);
        assert_eq!(status.reset_in_secs, 60);
        assert_eq!(counter.current_count("api", "1.2.3.4"), Some(1));
    }

    #[test]
    fn test_limit_exceeded_on_next_request() {
        let counter = WindowCounter::new();
        let now = Utc::now();

        for i in 0..3 {
            let status = counter.check_at("form", "1.2.3.4", MINUTE, 3, now);
            assert!(status.allowed, "request {} should be allowed", i + 1);
        }

        let status = counter.check_at("form", "1.2.3.4", MINUTE, 3, now);
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let counter = WindowCounter::new();
        let start = Utc::now();

        for _ in 0..4 {
            counter.check_at("form", "1.2.3.4", MINUTE, 3, start);
        }
        let denied = counter.check_at("form", "1.2.3.4", MINUTE, 3, start);
        assert!(!denied.allowed);

        let later = start + chrono::Duration::seconds(denied.reset_in_secs as i64 + 1);
        let status = counter.check_at("form", "1.2.3.4", MINUTE, 3, later);

        assert!(status.allowed);
        assert_eq!(status.remaining, 2);
        assert_eq!(counter.current_count("form", "1.2.3.4"), Some(1));
    }

    #[test]
    fn test_denied_at_reset_instant_reports_retry() {
        let counter = WindowCounter::new();
        let start = Utc::now();

        for _ in 0..4 {
            counter.check_at("form", "1.2.3.4", MINUTE, 3, start);
        }

        let reset_at = start + chrono::Duration::seconds(60);
        let status = counter.check_at("form", "1.2.3.4", MINUTE, 3, reset_at);
        assert!(!status.allowed);
        assert_eq!(status.reset_in_secs, 1);

        let retry = reset_at + chrono::Duration::seconds(status.reset_in_secs as i64);
        assert!(counter.check_at("form", "1.2.3.4", MINUTE, 3, retry).allowed);
    }

    #[test]
    fn test_reset_countdown_shrinks() {
        let counter = WindowCounter::new();
        let start = Utc::now();

        counter.check_at("api", "a", MINUTE, 10, start);
        let status = counter.check_at("api", "a", MINUTE, 10, start + chrono::Duration::milliseconds(20_500));

        assert_eq!(status.reset_in_secs, 40);
    }

    #[test]
    fn test_policies_are_isolated() {
        let counter = WindowCounter::new();
        let now = Utc::now();

        for _ in 0..5 {
            counter.check_at("form", "1.2.3.4", MINUTE, 3, now);
        }

        let api = counter.check_at("api", "1.2.3.4", MINUTE, 10, now);
        assert!(api.allowed);
        assert_eq!(api.remaining, 9);
    }

    #[test]
    fn test_zero_limit_denies_everything() {
        let counter = WindowCounter::new();
        let status = counter.check_at("api", "a", MINUTE, 0, Utc::now());
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
    }

    #[test]
    fn test_purge_keeps_entries_within_grace_window() {
        let counter = WindowCounter::new();
        let start = Utc::now();

        counter.check_at("api", "old", MINUTE, 10, start);
        counter.check_at("api", "fresh", MINUTE, 10, start + chrono::Duration::seconds(90));

        // "old" reset at +60s and becomes evictable after +120s.
        assert_eq!(counter.purge_expired(start + chrono::Duration::seconds(100)), 0);
        assert_eq!(counter.purge_expired(start + chrono::Duration::seconds(121)), 1);
        assert_eq!(counter.len(), 1);
        assert!(counter.current_count("api", "fresh").is_some());
    }

    #[test]
    fn test_concurrent_checks_do_not_lose_updates() {
        const THREADS: usize = 32;
        const LIMIT: u64 = 10;

        let counter = Arc::new(WindowCounter::new());
        let barrier = Arc::new(Barrier::new(THREADS));
        let now = Utc::now();

        let allowed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let counter = Arc::clone(&counter);
                    let barrier = Arc::clone(&barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        counter.check_at("auth", "same", MINUTE, LIMIT, now).allowed
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|allowed| *allowed)
                .count()
        });

        assert_eq!(allowed, LIMIT as usize);
        assert_eq!(counter.current_count("auth", "same"), Some(THREADS as u64));
    }

    #[test]
    fn test_seconds_until_rounds_up() {
        let now = Utc::now();
        assert_eq!(seconds_until(now + chrono::Duration::milliseconds(1), now), 1);
        assert_eq!(seconds_until(now + chrono::Duration::seconds(5), now), 5);
        assert_eq!(seconds_until(now - chrono::Duration::seconds(5), now), 0);
    }
}
