//! Periodic eviction of expired in-memory state.
//!
//! Every read path already checks expiry inline, so the sweeper only bounds
//! memory. Nothing depends on it having run.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::access::BlockList;
use crate::config::SweeperConfig;
use crate::login::LoginAttemptTracker;
use crate::ratelimit::WindowCounter;

/// When the sweeps run and how long idle attempt entries survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSchedule {
    /// Period of the counter and block-set sweep
    pub counter_interval: Duration,
    /// Period of the login attempt sweep
    pub attempt_interval: Duration,
    /// Idle time after which an unlocked attempt entry is dropped
    pub attempt_retention: Duration,
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self::from(&SweeperConfig::default())
    }
}

impl From<&SweeperConfig> for SweepSchedule {
    fn from(config: &SweeperConfig) -> Self {
        Self {
            counter_interval: Duration::from_secs(config.counter_interval_secs),
            attempt_interval: Duration::from_secs(config.attempt_interval_secs),
            attempt_retention: Duration::from_secs(config.attempt_retention_secs),
        }
    }
}

/// Handle to the running sweep tasks. Dropping it stops them.
pub struct Sweeper {
    tasks: Vec<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn the sweep tasks on the current tokio runtime.
    pub fn spawn(
        counters: Arc<WindowCounter>,
        tracker: Arc<LoginAttemptTracker>,
        blocks: Arc<BlockList>,
        schedule: SweepSchedule,
    ) -> Self {
        info!(
            counter_interval_secs = schedule.counter_interval.as_secs(),
            attempt_interval_secs = schedule.attempt_interval.as_secs(),
            "Starting eviction sweeper"
        );

        let counter_task = tokio::spawn(run_every(schedule.counter_interval, move || {
            let now = Utc::now();
            let counters_removed = counters.purge_expired(now);
            let blocks_removed = blocks.purge_expired(now);
            debug!(counters_removed, blocks_removed, "Counter sweep finished");
        }));

        let attempt_task = tokio::spawn(run_every(schedule.attempt_interval, move || {
            let removed = tracker.purge_stale(Utc::now(), schedule.attempt_retention);
            debug!(removed, "Login attempt sweep finished");
        }));

        Self {
            tasks: vec![counter_task, attempt_task],
        }
    }

    /// Stop the sweep tasks. In-flight sweeps are abandoned.
    pub fn shutdown(mut self) {
        self.abort_all();
        info!("Eviction sweeper stopped");
    }

    /// Whether any sweep task is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Run `sweep` every `period`, starting one period from now.
async fn run_every<F>(period: Duration, mut sweep: F)
where
    F: FnMut() + Send + 'static,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sweep();
    }
}
