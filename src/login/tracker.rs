//! Per-identifier login failure tracking with timed lockout.
//!
//! Each identifier moves through three states:
//!
//! - **Clean**: no entry, or an entry whose failures went stale.
//! - **Accumulating**: some failures, below the policy threshold.
//! - **Locked**: the threshold was reached and the lockout has not lapsed.
//!
//! Transitions out of Accumulating and Locked happen lazily when the entry is
//! next observed. No per-identifier timers are scheduled; the sweeper only
//! reclaims memory.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::access::BlockList;
use crate::policy::{PolicyConfig, LOCKOUT_DURATION};
use crate::ratelimit::chrono_duration;

/// Failure history for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptEntry {
    /// Consecutive failures since the last clean slate
    pub failure_count: u32,
    /// Time of the most recent failure
    pub last_failure_at: DateTime<Utc>,
    /// Set exactly when `failure_count` reached the threshold
    pub locked_until: Option<DateTime<Utc>>,
}

impl AttemptEntry {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            failure_count: 0,
            last_failure_at: now,
            locked_until: None,
        }
    }

    /// Whether the entry reads as Clean at `now`: a lapsed lock, or failures
    /// older than the failure window with no lock.
    fn is_expired(&self, now: DateTime<Utc>, failure_window: chrono::Duration) -> bool {
        match self.locked_until {
            Some(until) => now >= until,
            None => now - self.last_failure_at > failure_window,
        }
    }

    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

/// Whether an identifier may attempt to authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoginStatus {
    pub allowed: bool,
    /// Failures left before a lockout
    pub attempts_left: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailureOutcome {
    /// Whether the identifier is now locked
    pub blocked: bool,
    pub attempts_left: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
}

/// Tracks consecutive authentication failures and escalates to lockout.
///
/// Every read-modify-write on an identifier's entry runs under its shard's
/// write lock, so concurrent failures cannot both observe the threshold and
/// lock twice with different deadlines.
pub struct LoginAttemptTracker {
    entries: DashMap<String, AttemptEntry>,
    blocks: Arc<BlockList>,
    lockout: Duration,
}

impl LoginAttemptTracker {
    /// Create a tracker that pushes lockouts into `blocks`.
    pub fn new(blocks: Arc<BlockList>) -> Self {
        Self {
            entries: DashMap::new(),
            blocks,
            lockout: LOCKOUT_DURATION,
        }
    }

    /// Whether `identifier` may attempt to authenticate now.
    pub fn check_allowed(&self, identifier: &str, policy: &PolicyConfig) -> LoginStatus {
        self.check_allowed_at(identifier, policy, Utc::now())
    }

    /// Whether `identifier` may attempt to authenticate at `now`.
    ///
    /// A lapsed lock or stale failure history is deleted before the read,
    /// so a fresh set of failures is needed to lock again.
    pub fn check_allowed_at(
        &self,
        identifier: &str,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> LoginStatus {
        let threshold = policy.lockout_threshold();
        let failure_window = chrono_duration(policy.failure_window());

        if let Some((_, expired)) = self
            .entries
            .remove_if(identifier, |_, entry| entry.is_expired(now, failure_window))
        {
            debug!(
                identifier,
                failures = expired.failure_count,
                was_locked = expired.locked_until.is_some(),
                "Attempt history expired, identifier is clean"
            );
        }

        let status = match self.entries.get(identifier).map(|entry| *entry) {
            Some(entry) if entry.is_locked(now) => LoginStatus {
                allowed: false,
                attempts_left: 0,
                locked_until: entry.locked_until,
            },
            Some(entry) => LoginStatus {
                allowed: true,
                attempts_left: threshold.saturating_sub(entry.failure_count),
                locked_until: None,
            },
            None => LoginStatus {
                allowed: true,
                attempts_left: threshold,
                locked_until: None,
            },
        };

        trace!(
            identifier,
            allowed = status.allowed,
            attempts_left = status.attempts_left,
            "Checked login attempts"
        );

        status
    }

    /// Record a failed authentication for `identifier` now.
    pub fn record_failure(&self, identifier: &str, policy: &PolicyConfig) -> FailureOutcome {
        self.record_failure_at(identifier, policy, Utc::now())
    }

    /// Record a failed authentication observed at `now`.
    ///
    /// The failure that brings the count to the threshold sets the lock
    /// deadline and blocks the identifier's address. A failure recorded while
    /// already locked neither counts nor extends the lock.
    pub fn record_failure_at(
        &self,
        identifier: &str,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let threshold = policy.lockout_threshold();
        let failure_window = chrono_duration(policy.failure_window());

        let (outcome, newly_locked) = {
            let mut entry = self
                .entries
                .entry(identifier.to_string())
                .or_insert_with(|| AttemptEntry::fresh(now));

            if entry.is_expired(now, failure_window) {
                *entry = AttemptEntry::fresh(now);
            }

            if let Some(until) = entry.locked_until {
                let outcome = FailureOutcome {
                    blocked: true,
                    attempts_left: 0,
                    locked_until: Some(until),
                };
                (outcome, false)
            } else {
                entry.failure_count = entry.failure_count.saturating_add(1);
                entry.last_failure_at = now;

                if entry.failure_count >= threshold {
                    let until = now + chrono_duration(self.lockout);
                    entry.locked_until = Some(until);
                    let outcome = FailureOutcome {
                        blocked: true,
                        attempts_left: 0,
                        locked_until: Some(until),
                    };
                    (outcome, true)
                } else {
                    let outcome = FailureOutcome {
                        blocked: false,
                        attempts_left: threshold - entry.failure_count,
                        locked_until: None,
                    };
                    (outcome, false)
                }
            }
        };

        // Entry lock is released here; the block list takes its own shard lock.
        if newly_locked {
            if let Some(until) = outcome.locked_until {
                warn!(
                    identifier,
                    threshold,
                    until = %until,
                    "Too many failed logins, identifier locked out"
                );
                self.blocks.block(identifier, until);
            }
        } else {
            debug!(
                identifier,
                blocked = outcome.blocked,
                attempts_left = outcome.attempts_left,
                "Recorded failed login"
            );
        }

        outcome
    }

    /// Forget all failures for `identifier`, e.g. after a successful login.
    pub fn reset(&self, identifier: &str) {
        if self.entries.remove(identifier).is_some() {
            debug!(identifier, "Cleared login attempts");
        }
    }

    /// Snapshot of the stored entry, without applying lazy transitions.
    pub fn entry(&self, identifier: &str) -> Option<AttemptEntry> {
        self.entries.get(identifier).map(|entry| *entry)
    }

    /// Drop entries idle for longer than `retention` that are not locked.
    ///
    /// Returns the number of entries removed.
    pub fn purge_stale(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let retention = chrono_duration(retention);
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.is_locked(now) || now - entry.last_failure_at <= retention);
        before.saturating_sub(self.entries.len())
    }

    /// How long a lockout lasts.
    pub fn lockout_duration(&self) -> Duration {
        self.lockout
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
