//! IP access control: allow/deny patterns plus transient blocks.

mod blocklist;
mod control;
mod pattern;

pub use blocklist::BlockList;
pub use control::{AccessControl, AccessDecision, DenyReason};
pub use pattern::AddressPattern;
