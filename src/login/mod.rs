//! Brute-force protection for authentication endpoints.

mod tracker;

pub use tracker::{AttemptEntry, FailureOutcome, LoginAttemptTracker, LoginStatus};
