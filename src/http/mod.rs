//! HTTP check service in front of the gatekeeper.

mod identity;
mod server;
mod service;

pub use identity::{client_identifier, UNKNOWN_IDENTIFIER};
pub use server::HttpServer;
pub use service::{router, AppState, HealthResponse};
