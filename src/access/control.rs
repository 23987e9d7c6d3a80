//! Allow/deny evaluation for caller addresses.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use super::blocklist::BlockList;
use super::pattern::AddressPattern;
use crate::policy::PolicyConfig;

/// Cap on distinct pattern strings kept compiled.
const PATTERN_CACHE_CAPACITY: usize = 1024;

/// Why an address was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DenyReason {
    /// An allow-list is configured and the address matches none of it
    NotAllowed,
    /// The address matches a deny pattern
    DenyListed,
    /// The address is under a transient block after a lockout
    TemporarilyBlocked {
        /// When the block lapses
        until: DateTime<Utc>,
    },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAllowed => write!(f, "address is not on the allow-list"),
            Self::DenyListed => write!(f, "address is on the deny-list"),
            Self::TemporarilyBlocked { until } => {
                write!(f, "address is temporarily blocked until {}", until.to_rfc3339())
            }
        }
    }
}

/// Outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

impl AccessDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Evaluates addresses against the configured lists and the transient
/// block set.
///
/// Evaluation order: a non-empty allow-list is exclusive, then deny
/// patterns and transient blocks, then allow.
pub struct AccessControl {
    blocks: Arc<BlockList>,
    compiled: RwLock<HashMap<String, Option<AddressPattern>>>,
}

impl AccessControl {
    pub fn new(blocks: Arc<BlockList>) -> Self {
        Self {
            blocks,
            compiled: RwLock::new(HashMap::new()),
        }
    }

    /// Check `address` against `policy` now.
    pub fn check_access(&self, address: &str, policy: &PolicyConfig) -> AccessDecision {
        self.check_access_at(address, policy, Utc::now())
    }

    /// Check `address` against `policy` at `now`.
    pub fn check_access_at(
        &self,
        address: &str,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        trace!(address, "Checking address access");

        let allowed = policy.allowed_patterns();
        if !allowed.is_empty() && !self.matches_any(address, &allowed) {
            debug!(address, "Address not on allow-list");
            return AccessDecision::deny(DenyReason::NotAllowed);
        }

        if self.matches_any(address, &policy.blocked_patterns()) {
            debug!(address, "Address matched deny-list");
            return AccessDecision::deny(DenyReason::DenyListed);
        }

        if let Some(until) = self.blocks.blocked_until(address, now) {
            debug!(address, until = %until, "Address under transient block");
            return AccessDecision::deny(DenyReason::TemporarilyBlocked { until });
        }

        AccessDecision::allow()
    }

    /// The transient block set consulted by this evaluator.
    pub fn blocks(&self) -> &Arc<BlockList> {
        &self.blocks
    }

    fn matches_any(&self, address: &str, patterns: &[&str]) -> bool {
        patterns.iter().any(|pattern| self.matches(pattern, address))
    }

    fn matches(&self, pattern: &str, address: &str) -> bool {
        if let Some(compiled) = self.compiled.read().get(pattern) {
            return compiled.as_ref().is_some_and(|p| p.matches(address));
        }

        let compiled = AddressPattern::compile(pattern);
        let is_match = compiled.as_ref().is_some_and(|p| p.matches(address));

        let mut cache = self.compiled.write();
        if cache.len() >= PATTERN_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(pattern.to_string(), compiled);

        is_match
    }
}
