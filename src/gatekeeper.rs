//! Composition root wiring access control, throttles and the login tracker.
//!
//! An inbound request first passes access control, then its endpoint
//! throttle. Authentication additionally consults the login tracker before
//! credentials are checked and records the result afterwards.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::access::{AccessControl, AccessDecision, BlockList};
use crate::config::TurnstileConfig;
use crate::login::{FailureOutcome, LoginAttemptTracker, LoginStatus};
use crate::policy::{FilePolicySource, PolicyConfig, PolicySource, StaticPolicy};
use crate::ratelimit::{seconds_until, Endpoint, RateLimitStatus, Throttles, WindowCounter};
use crate::sweeper::{SweepSchedule, Sweeper};

/// Outcome of admitting a request to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Admission {
    /// Passed access control and the throttle
    Admitted { status: RateLimitStatus },
    /// Refused by access control; the throttle was not consulted
    Denied { access: AccessDecision },
    /// Over the endpoint's quota
    Throttled { status: RateLimitStatus },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }

    /// Throttle status, when the throttle was consulted.
    pub fn rate_limit(&self) -> Option<&RateLimitStatus> {
        match self {
            Admission::Admitted { status } | Admission::Throttled { status } => Some(status),
            Admission::Denied { .. } => None,
        }
    }
}

/// Whether credentials may be evaluated for an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum LoginGate {
    /// Credentials may be checked
    Open {
        status: LoginStatus,
        rate_limit: RateLimitStatus,
    },
    /// Refused by access control
    Denied { access: AccessDecision },
    /// Over the authentication throttle
    Throttled { status: RateLimitStatus },
    /// Locked out; credentials must not be checked
    LockedOut {
        locked_until: DateTime<Utc>,
        retry_after_secs: u64,
        rate_limit: RateLimitStatus,
    },
}

impl LoginGate {
    pub fn is_open(&self) -> bool {
        matches!(self, LoginGate::Open { .. })
    }

    /// Auth throttle status, when the throttle was consulted.
    pub fn rate_limit(&self) -> Option<&RateLimitStatus> {
        match self {
            LoginGate::Open { rate_limit, .. } | LoginGate::LockedOut { rate_limit, .. } => {
                Some(rate_limit)
            }
            LoginGate::Throttled { status } => Some(status),
            LoginGate::Denied { .. } => None,
        }
    }
}

/// Final result of an in-process authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Credentials accepted; failures were cleared
    Authenticated {
        session_timeout: Duration,
        rate_limit: RateLimitStatus,
    },
    /// Credentials rejected, below the lockout threshold
    InvalidCredentials {
        attempts_left: u32,
        rate_limit: RateLimitStatus,
    },
    /// Locked out, either before or because of this attempt
    LockedOut {
        locked_until: DateTime<Utc>,
        retry_after_secs: u64,
        rate_limit: RateLimitStatus,
    },
    /// Refused by access control
    Denied(AccessDecision),
    /// Over the authentication throttle
    Throttled(RateLimitStatus),
}

/// Owns every throttling store and the sweeper that evicts from them.
///
/// Construct one per process at startup and share it behind an `Arc`.
/// State is not shared between processes: each instance enforces its own
/// limits, so N replicas admit up to N times the configured quota.
pub struct Gatekeeper {
    throttles: Throttles,
    tracker: Arc<LoginAttemptTracker>,
    access: AccessControl,
    policy: Arc<dyn PolicySource>,
    schedule: SweepSchedule,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Gatekeeper {
    /// Create a gatekeeper with default quotas.
    pub fn new(policy: Arc<dyn PolicySource>) -> Self {
        Self::with_config(&TurnstileConfig::default(), policy)
    }

    /// Create a gatekeeper from configuration and an explicit policy source.
    pub fn with_config(config: &TurnstileConfig, policy: Arc<dyn PolicySource>) -> Self {
        let counters = Arc::new(WindowCounter::new());
        let blocks = Arc::new(BlockList::new());

        Self {
            throttles: Throttles::from_config(counters, &config.throttles),
            tracker: Arc::new(LoginAttemptTracker::new(Arc::clone(&blocks))),
            access: AccessControl::new(blocks),
            policy,
            schedule: SweepSchedule::from(&config.sweeper),
            sweeper: Mutex::new(None),
        }
    }

    /// Create a gatekeeper whose policy source is chosen by configuration:
    /// the policy file when one is set, otherwise the inline defaults.
    pub fn from_config(config: &TurnstileConfig) -> Self {
        let policy: Arc<dyn PolicySource> = match &config.policy.path {
            Some(path) => Arc::new(FilePolicySource::new(
                path.clone(),
                Duration::from_secs(config.policy.cache_ttl_secs),
            )),
            None => Arc::new(StaticPolicy::new(config.policy.defaults.clone())),
        };
        Self::with_config(config, policy)
    }

    /// Admit a request for `endpoint` from `identifier`.
    pub fn admit(&self, endpoint: Endpoint, identifier: &str) -> Admission {
        self.admit_at(endpoint, identifier, Utc::now())
    }

    /// Admit a request observed at `now`.
    pub fn admit_at(&self, endpoint: Endpoint, identifier: &str, now: DateTime<Utc>) -> Admission {
        let policy = self.policy.policy();

        let access = self.access.check_access_at(identifier, &policy, now);
        if !access.allowed {
            return Admission::Denied { access };
        }

        let status = self.throttles.check_at(endpoint, identifier, now);
        if status.allowed {
            Admission::Admitted { status }
        } else {
            Admission::Throttled { status }
        }
    }

    /// Hook for form submissions.
    pub fn submit_form(&self, identifier: &str) -> Admission {
        self.admit(Endpoint::Form, identifier)
    }

    /// Decide whether credentials may be checked for `identifier`.
    pub fn precheck_login(&self, identifier: &str) -> LoginGate {
        self.precheck_login_at(identifier, Utc::now())
    }

    /// Decide at `now` whether credentials may be checked.
    pub fn precheck_login_at(&self, identifier: &str, now: DateTime<Utc>) -> LoginGate {
        let policy = self.policy.policy();
        self.gate(identifier, &policy, now)
    }

    /// Record rejected credentials for `identifier`.
    pub fn record_login_failure(&self, identifier: &str) -> FailureOutcome {
        self.record_login_failure_at(identifier, Utc::now())
    }

    /// Record rejected credentials observed at `now`.
    pub fn record_login_failure_at(&self, identifier: &str, now: DateTime<Utc>) -> FailureOutcome {
        let policy = self.policy.policy();
        self.tracker.record_failure_at(identifier, &policy, now)
    }

    /// Record accepted credentials, clearing the failure history.
    pub fn record_login_success(&self, identifier: &str) {
        self.tracker.reset(identifier);
    }

    /// Run a full authentication attempt.
    ///
    /// `verify` is only awaited when the gate is open, so a locked identifier
    /// never reaches credential comparison. No store lock is held across the
    /// await.
    pub async fn authenticate<F, Fut>(&self, identifier: &str, verify: F) -> LoginOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let policy = self.policy.policy();

        let rate_limit = match self.gate(identifier, &policy, Utc::now()) {
            LoginGate::Open { rate_limit, .. } => rate_limit,
            LoginGate::Denied { access } => return LoginOutcome::Denied(access),
            LoginGate::Throttled { status } => return LoginOutcome::Throttled(status),
            LoginGate::LockedOut {
                locked_until,
                retry_after_secs,
                rate_limit,
            } => {
                return LoginOutcome::LockedOut {
                    locked_until,
                    retry_after_secs,
                    rate_limit,
                }
            }
        };

        if verify().await {
            self.tracker.reset(identifier);
            debug!(identifier, "Authentication succeeded");
            return LoginOutcome::Authenticated {
                session_timeout: policy.session_timeout(),
                rate_limit,
            };
        }

        let now = Utc::now();
        let outcome = self.tracker.record_failure_at(identifier, &policy, now);
        match outcome.locked_until {
            Some(locked_until) if outcome.blocked => LoginOutcome::LockedOut {
                locked_until,
                retry_after_secs: seconds_until(locked_until, now),
                rate_limit,
            },
            _ => LoginOutcome::InvalidCredentials {
                attempts_left: outcome.attempts_left,
                rate_limit,
            },
        }
    }

    /// Clear both the failure history and any transient block.
    pub fn unlock(&self, identifier: &str) {
        self.tracker.reset(identifier);
        if self.access.blocks().unblock(identifier) {
            info!(identifier, "Address block lifted");
        }
    }

    /// Session lifetime under the current policy.
    pub fn session_timeout(&self) -> Duration {
        self.policy.policy().session_timeout()
    }

    /// The policy currently in force.
    pub fn policy(&self) -> PolicyConfig {
        self.policy.policy()
    }

    /// Start the eviction sweeper if it is not already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(Sweeper::spawn(
                Arc::clone(self.throttles.counter()),
                Arc::clone(&self.tracker),
                Arc::clone(self.access.blocks()),
                self.schedule,
            ));
        }
    }

    /// Whether the eviction sweeper is running.
    pub fn sweeper_running(&self) -> bool {
        self.sweeper.lock().as_ref().is_some_and(Sweeper::is_running)
    }

    /// Stop the eviction sweeper.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.shutdown();
        }
    }

    pub fn throttles(&self) -> &Throttles {
        &self.throttles
    }

    pub fn tracker(&self) -> &Arc<LoginAttemptTracker> {
        &self.tracker
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    fn gate(&self, identifier: &str, policy: &PolicyConfig, now: DateTime<Utc>) -> LoginGate {
        let access = self.access.check_access_at(identifier, policy, now);
        if !access.allowed {
            return LoginGate::Denied { access };
        }

        let rate_limit = self.throttles.check_at(Endpoint::Auth, identifier, now);
        if !rate_limit.allowed {
            return LoginGate::Throttled { status: rate_limit };
        }

        let status = self.tracker.check_allowed_at(identifier, policy, now);
        match status.locked_until {
            Some(locked_until) if !status.allowed => LoginGate::LockedOut {
                locked_until,
                retry_after_secs: seconds_until(locked_until, now),
                rate_limit,
            },
            _ => LoginGate::Open { status, rate_limit },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::DenyReason;
    use crate::config::ThrottleRule;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gatekeeper(policy: PolicyConfig) -> (Gatekeeper, Arc<StaticPolicy>) {
        let source = Arc::new(StaticPolicy::new(policy));
        (Gatekeeper::new(source.clone()), source)
    }

    /// Auth throttle wide enough to exercise the tracker alone.
    fn lenient_auth() -> TurnstileConfig {
        let mut config = TurnstileConfig::default();
        config.throttles.auth = ThrottleRule {
            limit: 1000,
            window_secs: 900,
        };
        config
    }

    #[test]
    fn test_admit_runs_access_before_throttle() {
        let (gatekeeper, _) = gatekeeper(PolicyConfig {
            blocked_ips: "10.0.0.*".to_string(),
            ..PolicyConfig::default()
        });

        let admission = gatekeeper.admit(Endpoint::Api, "10.0.0.5");
        assert_eq!(
            admission,
            Admission::Denied {
                access: AccessDecision {
                    allowed: false,
                    reason: Some(DenyReason::DenyListed),
                }
            }
        );
        assert_eq!(gatekeeper.throttles().counter().current_count("api", "10.0.0.5"), None);
    }

    #[test]
    fn test_form_submissions_are_throttled() {
        let (gatekeeper, _) = gatekeeper(PolicyConfig::default());

        for _ in 0..3 {
            assert!(gatekeeper.submit_form("203.0.113.1").is_allowed());
        }
        let fourth = gatekeeper.submit_form("203.0.113.1");
        assert!(matches!(fourth, Admission::Throttled { .. }));
        assert_eq!(fourth.rate_limit().unwrap().remaining, 0);

        assert!(gatekeeper.admit(Endpoint::Api, "203.0.113.1").is_allowed());
    }

    #[test]
    fn test_policy_changes_apply_without_rebuild() {
        let (gatekeeper, source) = gatekeeper(PolicyConfig::default());
        assert!(gatekeeper.admit(Endpoint::Api, "192.168.2.5").is_allowed());

        source.update(PolicyConfig {
            allowed_ips: "192.168.1.*".to_string(),
            ..PolicyConfig::default()
        });
        assert!(!gatekeeper.admit(Endpoint::Api, "192.168.2.5").is_allowed());
        assert!(gatekeeper.admit(Endpoint::Api, "192.168.1.5").is_allowed());
    }

    #[test]
    fn test_lockout_then_address_block() {
        let source = Arc::new(StaticPolicy::new(PolicyConfig::default()));
        let gatekeeper = Gatekeeper::with_config(&lenient_auth(), source);
        let now = Utc::now();

        for _ in 0..5 {
            assert!(gatekeeper.precheck_login_at("198.51.100.2", now).is_open());
            gatekeeper.record_login_failure_at("198.51.100.2", now);
        }

        // The address block now rejects the caller before the tracker runs.
        let gate = gatekeeper.precheck_login_at("198.51.100.2", now);
        let until = now + ChronoDuration::minutes(30);
        assert_eq!(
            gate,
            LoginGate::Denied {
                access: AccessDecision {
                    allowed: false,
                    reason: Some(DenyReason::TemporarilyBlocked { until }),
                }
            }
        );
        assert!(!gatekeeper.admit_at(Endpoint::Api, "198.51.100.2", now).is_allowed());

        let after = until + ChronoDuration::seconds(1);
        match gatekeeper.precheck_login_at("198.51.100.2", after) {
            LoginGate::Open { status, .. } => assert_eq!(status.attempts_left, 5),
            other => panic!("expected open gate, got {other:?}"),
        }
    }

    #[test]
    fn test_locked_gate_without_address_block() {
        let source = Arc::new(StaticPolicy::new(PolicyConfig::default()));
        let gatekeeper = Gatekeeper::with_config(&lenient_auth(), source);
        let now = Utc::now();

        for _ in 0..5 {
            gatekeeper.record_login_failure_at("client-7", now);
        }
        gatekeeper.access().blocks().unblock("client-7");

        match gatekeeper.precheck_login_at("client-7", now + ChronoDuration::minutes(10)) {
            LoginGate::LockedOut {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 20 * 60),
            other => panic!("expected lockout, got {other:?}"),
        }
    }

    #[test]
    fn test_auth_throttle_applies_to_prechecks() {
        let (gatekeeper, _) = gatekeeper(PolicyConfig::default());
        let now = Utc::now();

        for _ in 0..5 {
            assert!(gatekeeper.precheck_login_at("10.1.1.1", now).is_open());
        }
        assert!(matches!(
            gatekeeper.precheck_login_at("10.1.1.1", now),
            LoginGate::Throttled { .. }
        ));
    }

    #[test]
    fn test_precheck_reports_auth_throttle_status() {
        let (gatekeeper, _) = gatekeeper(PolicyConfig::default());
        let now = Utc::now();

        let gate = gatekeeper.precheck_login_at("10.1.2.3", now);
        match gate {
            LoginGate::Open { status, rate_limit } => {
                assert_eq!(status.attempts_left, 5);
                assert!(rate_limit.allowed);
                assert_eq!(rate_limit.limit, 5);
                assert_eq!(rate_limit.remaining, 4);
                assert_eq!(rate_limit.reset_in_secs, 900);
            }
            other => panic!("expected open gate, got {other:?}"),
        }
        assert_eq!(gate.rate_limit().map(|r| r.remaining), Some(4));
    }

    #[test]
    fn test_locked_gate_reports_auth_throttle_status() {
        let source = Arc::new(StaticPolicy::new(PolicyConfig::default()));
        let gatekeeper = Gatekeeper::with_config(&lenient_auth(), source);
        let now = Utc::now();

        for _ in 0..5 {
            gatekeeper.record_login_failure_at("client-8", now);
        }
        gatekeeper.access().blocks().unblock("client-8");

        match gatekeeper.precheck_login_at("client-8", now) {
            LoginGate::LockedOut { rate_limit, .. } => {
                assert_eq!(rate_limit.limit, 1000);
                assert_eq!(rate_limit.remaining, 999);
            }
            other => panic!("expected lockout, got {other:?}"),
        }
    }

    #[test]
    fn test_unlock_clears_tracker_and_block() {
        let source = Arc::new(StaticPolicy::new(PolicyConfig::default()));
        let gatekeeper = Gatekeeper::with_config(&lenient_auth(), source);

        for _ in 0..5 {
            gatekeeper.record_login_failure("10.2.2.2");
        }
        assert!(!gatekeeper.precheck_login("10.2.2.2").is_open());

        gatekeeper.unlock("10.2.2.2");
        assert!(gatekeeper.precheck_login("10.2.2.2").is_open());
    }

    #[tokio::test]
    async fn test_authenticate_success_resets_failures() {
        let (gatekeeper, _) = gatekeeper(PolicyConfig::default());

        let outcome = gatekeeper.authenticate("10.3.3.3", || async { false }).await;
        match outcome {
            LoginOutcome::InvalidCredentials {
                attempts_left,
                rate_limit,
            } => {
                assert_eq!(attempts_left, 4);
                assert_eq!(rate_limit.limit, 5);
                assert_eq!(rate_limit.remaining, 4);
            }
            other => panic!("expected invalid credentials, got {other:?}"),
        }

        let outcome = gatekeeper.authenticate("10.3.3.3", || async { true }).await;
        match outcome {
            LoginOutcome::Authenticated {
                session_timeout,
                rate_limit,
            } => {
                assert_eq!(session_timeout, Duration::from_secs(3600));
                assert_eq!(rate_limit.remaining, 3);
            }
            other => panic!("expected authentication, got {other:?}"),
        }
        assert!(gatekeeper.tracker().entry("10.3.3.3").is_none());
    }

    #[tokio::test]
    async fn test_authenticate_never_verifies_when_locked() {
        let source = Arc::new(StaticPolicy::new(PolicyConfig {
            max_login_attempts: 3,
            ..PolicyConfig::default()
        }));
        let gatekeeper = Gatekeeper::with_config(&lenient_auth(), source);
        let verified = AtomicUsize::new(0);
        let calls = &verified;

        for _ in 0..3 {
            gatekeeper
                .authenticate("10.4.4.4", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    false
                })
                .await;
        }
        assert_eq!(verified.load(Ordering::SeqCst), 3);

        let outcome = gatekeeper
            .authenticate("10.4.4.4", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            })
            .await;

        assert!(matches!(outcome, LoginOutcome::Denied(_)));
        assert_eq!(verified.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_third_failure_reports_lockout() {
        let source = Arc::new(StaticPolicy::new(PolicyConfig {
            max_login_attempts: 3,
            ..PolicyConfig::default()
        }));
        let gatekeeper = Gatekeeper::with_config(&lenient_auth(), source);

        gatekeeper.authenticate("a", || async { false }).await;
        gatekeeper.authenticate("a", || async { false }).await;
        match gatekeeper.authenticate("a", || async { false }).await {
            LoginOutcome::LockedOut {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 30 * 60),
            other => panic!("expected lockout, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_respect_limit() {
        const REQUESTS: usize = 64;

        let (gatekeeper, _) = gatekeeper(PolicyConfig::default());
        let gatekeeper = Arc::new(gatekeeper);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..REQUESTS {
            let gatekeeper = Arc::clone(&gatekeeper);
            tasks.spawn(async move { gatekeeper.admit(Endpoint::Api, "shared").is_allowed() });
        }

        let mut allowed = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_sweeper_lifecycle() {
        let (gatekeeper, _) = gatekeeper(PolicyConfig::default());
        assert!(!gatekeeper.sweeper_running());

        gatekeeper.start_sweeper();
        gatekeeper.start_sweeper();
        assert!(gatekeeper.sweeper_running());

        gatekeeper.shutdown();
        assert!(!gatekeeper.sweeper_running());
    }

    #[test]
    fn test_from_config_uses_inline_policy() {
        let mut config = TurnstileConfig::default();
        config.policy.defaults.max_login_attempts = 2;

        let gatekeeper = Gatekeeper::from_config(&config);
        assert_eq!(gatekeeper.policy().max_login_attempts, 2);
    }
}
