//! Fixed-window rate limiting and the per-endpoint throttles.

mod counter;
mod key;
mod throttle;

pub use counter::{CounterEntry, RateLimitStatus, WindowCounter};
pub(crate) use counter::{chrono_duration, seconds_until};
pub use key::CounterKey;
pub use throttle::{Endpoint, ThrottlePolicy, Throttles};
