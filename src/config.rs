//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::policy::PolicyConfig;

/// Environment variable prefix for layered configuration.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Endpoint throttle quotas
    #[serde(default)]
    pub throttles: ThrottleConfig,

    /// Background eviction schedule
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Where the runtime policy comes from
    #[serde(default)]
    pub policy: PolicySourceConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Default log filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A quota over a fixed window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRule {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl ThrottleRule {
    /// 10 requests per minute.
    pub fn api() -> Self {
        Self {
            limit: 10,
            window_secs: 60,
        }
    }

    /// 3 submissions per hour.
    pub fn form() -> Self {
        Self {
            limit: 3,
            window_secs: 3600,
        }
    }

    /// 5 attempts per 15 minutes.
    pub fn auth() -> Self {
        Self {
            limit: 5,
            window_secs: 900,
        }
    }

    /// The window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Quotas for the three endpoint throttles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "ThrottleRule::api")]
    pub api: ThrottleRule,

    #[serde(default = "ThrottleRule::form")]
    pub form: ThrottleRule,

    #[serde(default = "ThrottleRule::auth")]
    pub auth: ThrottleRule,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            api: ThrottleRule::api(),
            form: ThrottleRule::form(),
            auth: ThrottleRule::auth(),
        }
    }
}

/// Eviction sweeper schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between counter and block-set sweeps
    #[serde(default = "default_counter_interval")]
    pub counter_interval_secs: u64,

    /// Seconds between login attempt sweeps
    #[serde(default = "default_attempt_interval")]
    pub attempt_interval_secs: u64,

    /// How long an idle attempt entry is kept before eviction
    #[serde(default = "default_attempt_retention")]
    pub attempt_retention_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            counter_interval_secs: default_counter_interval(),
            attempt_interval_secs: default_attempt_interval(),
            attempt_retention_secs: default_attempt_retention(),
        }
    }
}

fn default_counter_interval() -> u64 {
    600
}

fn default_attempt_interval() -> u64 {
    3600
}

fn default_attempt_retention() -> u64 {
    86400
}

/// Runtime policy source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySourceConfig {
    /// Optional YAML file holding the live policy
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Seconds a loaded policy file is trusted before it is re-read
    #[serde(default = "default_policy_ttl")]
    pub cache_ttl_secs: u64,

    /// Policy used when no file is configured
    #[serde(default)]
    pub defaults: PolicyConfig,
}

impl Default for PolicySourceConfig {
    fn default() -> Self {
        Self {
            path: None,
            cache_ttl_secs: default_policy_ttl(),
            defaults: PolicyConfig::default(),
        }
    }
}

fn default_policy_ttl() -> u64 {
    5
}

impl TurnstileConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TurnstileConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under
    /// `TURNSTILE__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: TurnstileConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a safeguard.
    pub fn validate(&self) -> Result<()> {
        for (name, rule) in [
            ("api", &self.throttles.api),
            ("form", &self.throttles.form),
            ("auth", &self.throttles.auth),
        ] {
            if rule.limit == 0 {
                return Err(TurnstileError::Config(format!(
                    "throttles.{name}.limit must be > 0"
                )));
            }
            if rule.window_secs == 0 {
                return Err(TurnstileError::Config(format!(
                    "throttles.{name}.window_secs must be > 0"
                )));
            }
        }

        if self.sweeper.counter_interval_secs == 0 || self.sweeper.attempt_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "sweeper intervals must be > 0".to_string(),
            ));
        }

        if self.policy.defaults.max_login_attempts == 0 {
            return Err(TurnstileError::Config(
                "policy.defaults.max_login_attempts must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
