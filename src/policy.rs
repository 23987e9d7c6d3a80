//! Runtime security policy and the sources it is read from.
//!
//! Operators tune the policy without redeploying, so every check asks its
//! [`PolicySource`] for a fresh [`PolicyConfig`] instead of caching one for
//! the life of the process.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::Result;

/// How long a lockout lasts once triggered.
///
/// Fixed rather than configurable; only the attempt threshold is a tunable.
pub const LOCKOUT_DURATION: Duration = Duration::from_secs(30 * 60);

/// Tunable security policy supplied by the hosting application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Consecutive failures that trigger a lockout
    #[serde(default = "default_max_login_attempts")]
    pub max_login_attempts: u32,

    /// Inactivity after which accumulated failures are forgotten
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    /// Session lifetime handed back to the caller on success
    #[serde(default = "default_session_timeout_minutes")]
    pub session_timeout_minutes: u64,

    /// Comma-separated allow patterns; when non-empty only matches pass
    #[serde(default)]
    pub allowed_ips: String,

    /// Comma-separated deny patterns
    #[serde(default)]
    pub blocked_ips: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_login_attempts: default_max_login_attempts(),
            failure_window_secs: default_failure_window_secs(),
            session_timeout_minutes: default_session_timeout_minutes(),
            allowed_ips: String::new(),
            blocked_ips: String::new(),
        }
    }
}

fn default_max_login_attempts() -> u32 {
    5
}

fn default_failure_window_secs() -> u64 {
    15 * 60
}

fn default_session_timeout_minutes() -> u64 {
    60
}

impl PolicyConfig {
    /// Allow-list entries, trimmed, empties dropped.
    pub fn allowed_patterns(&self) -> Vec<&str> {
        split_patterns(&self.allowed_ips)
    }

    /// Deny-list entries, trimmed, empties dropped.
    pub fn blocked_patterns(&self) -> Vec<&str> {
        split_patterns(&self.blocked_ips)
    }

    /// The failure window as a duration.
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    /// The session lifetime as a duration.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes.saturating_mul(60))
    }

    /// The lockout threshold, never below one.
    pub fn lockout_threshold(&self) -> u32 {
        self.max_login_attempts.max(1)
    }

    /// Load a policy from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}

fn split_patterns(list: &str) -> Vec<&str> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Supplies the current policy for each check.
pub trait PolicySource: Send + Sync {
    /// The policy in force right now.
    fn policy(&self) -> PolicyConfig;
}

/// A policy held in memory and replaced explicitly.
#[derive(Debug, Default)]
pub struct StaticPolicy {
    current: RwLock<PolicyConfig>,
}

impl StaticPolicy {
    pub fn new(policy: PolicyConfig) -> Self {
        Self {
            current: RwLock::new(policy),
        }
    }

    /// Replace the policy; the next check observes the new values.
    pub fn update(&self, policy: PolicyConfig) {
        *self.current.write() = policy;
    }
}

impl PolicySource for StaticPolicy {
    fn policy(&self) -> PolicyConfig {
        self.current.read().clone()
    }
}

/// A policy read from a YAML file and re-read once its cache entry is older
/// than the configured TTL.
///
/// A failed reload keeps serving the last good policy.
pub struct FilePolicySource {
    path: PathBuf,
    ttl: Duration,
    cached: RwLock<Option<CachedPolicy>>,
}

struct CachedPolicy {
    loaded_at: Instant,
    policy: PolicyConfig,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            cached: RwLock::new(None),
        }
    }

    fn is_fresh(&self, cached: &CachedPolicy) -> bool {
        !self.ttl.is_zero() && cached.loaded_at.elapsed() < self.ttl
    }
}

impl PolicySource for FilePolicySource {
    fn policy(&self) -> PolicyConfig {
        if let Some(cached) = self.cached.read().as_ref() {
            if self.is_fresh(cached) {
                return cached.policy.clone();
            }
        }

        let mut cached = self.cached.write();
        // Another reader may have reloaded while we waited for the lock.
        if let Some(current) = cached.as_ref() {
            if self.is_fresh(current) {
                return current.policy.clone();
            }
        }

        match PolicyConfig::from_file(&self.path) {
            Ok(policy) => {
                debug!(path = %self.path.display(), "Reloaded policy file");
                *cached = Some(CachedPolicy {
                    loaded_at: Instant::now(),
                    policy: policy.clone(),
                });
                policy
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to reload policy file, keeping previous policy"
                );
                match cached.as_mut() {
                    Some(previous) => {
                        previous.loaded_at = Instant::now();
                        previous.policy.clone()
                    }
                    None => PolicyConfig::default(),
                }
            }
        }
    }
}
