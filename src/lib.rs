//! Turnstile - Request Throttling and Brute-Force Protection
//!
//! This crate implements an in-memory protection core for web applications:
//! fixed-window throttles per endpoint class, a login attempt tracker with
//! temporary lockout, IP allow/deny lists with wildcard patterns, and a
//! background sweeper that bounds memory use.
//!
//! All state lives in a single process. Running several instances behind a
//! load balancer multiplies the effective limits by the instance count.

pub mod access;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod http;
pub mod login;
pub mod policy;
pub mod ratelimit;
pub mod sweeper;

pub use error::{Result, TurnstileError};
pub use gatekeeper::{Admission, Gatekeeper, LoginGate, LoginOutcome};
