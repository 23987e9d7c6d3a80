//! Transient address blocks with self-expiry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

/// Addresses blocked until a deadline.
///
/// Populated by the login tracker when a lockout triggers and consulted by
/// access control on every request. Expired blocks are ignored on read and
/// removed by the sweeper.
#[derive(Debug, Default)]
pub struct BlockList {
    entries: DashMap<String, DateTime<Utc>>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `address` until `until`. An existing later deadline is kept.
    pub fn block(&self, address: &str, until: DateTime<Utc>) {
        let deadline = {
            let mut deadline = self.entries.entry(address.to_string()).or_insert(until);
            if *deadline < until {
                *deadline = until;
            }
            *deadline
        };
        warn!(address, until = %deadline, "Address temporarily blocked");
    }

    /// Lift a block early.
    pub fn unblock(&self, address: &str) -> bool {
        self.entries.remove(address).is_some()
    }

    /// The active block deadline for `address` at `now`, if any.
    pub fn blocked_until(&self, address: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .get(address)
            .map(|deadline| *deadline)
            .filter(|deadline| now < *deadline)
    }

    /// Whether `address` is blocked at `now`.
    pub fn is_blocked(&self, address: &str, now: DateTime<Utc>) -> bool {
        self.blocked_until(address, now).is_some()
    }

    /// Remove expired blocks. Returns the number removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, deadline| now < *deadline);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired address blocks");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
