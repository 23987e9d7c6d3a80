//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Throttle, lockout and access decisions are never errors; they are
/// reported through their outcome types. This enum only covers the
/// surrounding service: configuration, policy files and the HTTP listener.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration loading errors
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// YAML parse errors for configuration and policy files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
