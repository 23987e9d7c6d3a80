//! Endpoint throttles built on the shared window counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::counter::{RateLimitStatus, WindowCounter};
use crate::config::{ThrottleConfig, ThrottleRule};

/// The endpoint classes that carry their own throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    /// General API calls
    Api,
    /// Public form submissions (quote requests, contact forms)
    Form,
    /// Authentication attempts
    Auth,
}

impl Endpoint {
    /// The policy name, which doubles as the counter keyspace.
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Api => "api",
            Endpoint::Form => "form",
            Endpoint::Auth => "auth",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named quota over a fixed window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottlePolicy {
    /// Policy name, used as the counter keyspace
    pub name: &'static str,
    /// Maximum requests allowed in the window
    pub limit: u64,
    /// Window length
    pub window: Duration,
}

impl ThrottlePolicy {
    /// 10 requests per minute.
    pub fn api() -> Self {
        Self::new(Endpoint::Api, &ThrottleRule::api())
    }

    /// 3 submissions per hour.
    pub fn form() -> Self {
        Self::new(Endpoint::Form, &ThrottleRule::form())
    }

    /// 5 attempts per 15 minutes.
    pub fn auth() -> Self {
        Self::new(Endpoint::Auth, &ThrottleRule::auth())
    }

    /// Build the policy for `endpoint` from a configured rule.
    pub fn new(endpoint: Endpoint, rule: &ThrottleRule) -> Self {
        Self {
            name: endpoint.as_str(),
            limit: rule.limit,
            window: rule.window(),
        }
    }
}

/// The three preconfigured endpoint throttles.
///
/// All policies share one [`WindowCounter`] but count under their own policy
/// name, so exhausting one never affects another.
pub struct Throttles {
    counter: Arc<WindowCounter>,
    api: ThrottlePolicy,
    form: ThrottlePolicy,
    auth: ThrottlePolicy,
}

impl Throttles {
    /// Create throttles with the default quotas.
    pub fn new(counter: Arc<WindowCounter>) -> Self {
        Self::from_config(counter, &ThrottleConfig::default())
    }

    /// Create throttles from configuration.
    pub fn from_config(counter: Arc<WindowCounter>, config: &ThrottleConfig) -> Self {
        Self {
            counter,
            api: ThrottlePolicy::new(Endpoint::Api, &config.api),
            form: ThrottlePolicy::new(Endpoint::Form, &config.form),
            auth: ThrottlePolicy::new(Endpoint::Auth, &config.auth),
        }
    }

    /// The policy applied to `endpoint`.
    pub fn policy(&self, endpoint: Endpoint) -> &ThrottlePolicy {
        match endpoint {
            Endpoint::Api => &self.api,
            Endpoint::Form => &self.form,
            Endpoint::Auth => &self.auth,
        }
    }

    /// Count a request for `identifier` against the endpoint's throttle.
    pub fn check(&self, endpoint: Endpoint, identifier: &str) -> RateLimitStatus {
        self.check_at(endpoint, identifier, Utc::now())
    }

    /// Count a request observed at `now`.
    pub fn check_at(&self, endpoint: Endpoint, identifier: &str, now: DateTime<Utc>) -> RateLimitStatus {
        let policy = self.policy(endpoint);
        let status = self
            .counter
            .check_at(policy.name, identifier, policy.window, policy.limit, now);

        if !status.allowed {
            debug!(
                endpoint = %endpoint,
                identifier,
                retry_after_secs = status.reset_in_secs,
                "Endpoint throttle rejected request"
            );
        }

        status
    }

    /// The shared counter store.
    pub fn counter(&self) -> &Arc<WindowCounter> {
        &self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttles() -> Throttles {
        Throttles::new(Arc::new(WindowCounter::new()))
    }

    #[test]
    fn test_default_policies() {
        assert_eq!(ThrottlePolicy::api().limit, 10);
        assert_eq!(ThrottlePolicy::api().window, Duration::from_secs(60));
        assert_eq!(ThrottlePolicy::form().limit, 3);
        assert_eq!(ThrottlePolicy::form().window, Duration::from_secs(3600));
        assert_eq!(ThrottlePolicy::auth().limit, 5);
        assert_eq!(ThrottlePolicy::auth().window, Duration::from_secs(900));
    }

    #[test]
    fn test_form_throttle_window() {
        let throttles = throttles();
        let now = Utc::now();

        for _ in 0..3 {
            assert!(throttles.check_at(Endpoint::Form, "10.0.0.1", now).allowed);
        }
        let denied = throttles.check_at(Endpoint::Form, "10.0.0.1", now);
        assert!(!denied.allowed);
        assert_eq!(denied.reset_in_secs, 3600);

        let later = now + chrono::Duration::seconds(3601);
        let status = throttles.check_at(Endpoint::Form, "10.0.0.1", later);
        assert!(status.allowed);
        assert_eq!(status.remaining, 2);
    }

    #[test]
    fn test_exhausting_form_leaves_api_and_auth_untouched() {
        let throttles = throttles();
        let now = Utc::now();

        for _ in 0..10 {
            throttles.check_at(Endpoint::Form, "10.0.0.1", now);
        }
        assert!(!throttles.check_at(Endpoint::Form, "10.0.0.1", now).allowed);

        let api = throttles.check_at(Endpoint::Api, "10.0.0.1", now);
        assert!(api.allowed);
        assert_eq!(api.remaining, 9);

        let auth = throttles.check_at(Endpoint::Auth, "10.0.0.1", now);
        assert!(auth.allowed);
        assert_eq!(auth.remaining, 4);
    }

    #[test]
    fn test_configured_rules_are_applied() {
        let config = ThrottleConfig {
            api: ThrottleRule {
                limit: 2,
                window_secs: 1,
            },
            ..ThrottleConfig::default()
        };
        let throttles = Throttles::from_config(Arc::new(WindowCounter::new()), &config);
        let now = Utc::now();

        assert!(throttles.check_at(Endpoint::Api, "x", now).allowed);
        assert!(throttles.check_at(Endpoint::Api, "x", now).allowed);
        assert!(!throttles.check_at(Endpoint::Api, "x", now).allowed);
        assert_eq!(throttles.policy(Endpoint::Api).window, Duration::from_secs(1));
    }

    #[test]
    fn test_endpoint_deserializes_lowercase() {
        let endpoint: Endpoint = serde_json::from_str("\"form\"").unwrap();
        assert_eq!(endpoint, Endpoint::Form);
        assert_eq!(Endpoint::Auth.to_string(), "auth");
    }
}
