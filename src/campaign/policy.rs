//! Time-based campaign stop policies.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::config::CampaignConfig;

/// Why a worker stopped taking new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The test source ran dry.
    Exhausted,
    /// The total campaign budget was exceeded.
    TotalTimeExceeded,
    /// No kill happened within the allowed window.
    NoRecentKill,
    /// An operator asked the worker to stop.
    Interrupted,
}

/// The two independent duration limits. Zero disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    /// Limit on time since campaign start.
    pub total_test_time: Duration,
    /// Limit on time since the last successful kill.
    pub maximum_time_since_last_kill: Duration,
}

impl StopPolicy {
    /// Policy that never fires.
    pub const UNBOUNDED: Self = Self {
        total_test_time: Duration::ZERO,
        maximum_time_since_last_kill: Duration::ZERO,
    };

    /// Limits taken from the campaign configuration.
    pub fn from_config(config: &CampaignConfig) -> Self {
        Self {
            total_test_time: config.total_test_time,
            maximum_time_since_last_kill: config.maximum_time_since_last_kill,
        }
    }
}

fn exceeded(limit: Duration, elapsed: Duration) -> bool {
    !limit.is_zero() && elapsed > limit
}

/// Campaign start and last-kill watermark for one worker.
#[derive(Debug, Clone, Copy)]
pub struct CampaignClock {
    policy: StopPolicy,
    started: Instant,
    last_kill: Instant,
}

impl CampaignClock {
    /// Clock starting now.
    pub fn start(policy: StopPolicy) -> Self {
        Self::start_at(policy, Instant::now())
    }

    /// Clock starting at `now`.
    pub fn start_at(policy: StopPolicy, now: Instant) -> Self {
        Self {
            policy,
            started: now,
            last_kill: now,
        }
    }

    /// Move the last-kill watermark to `now`.
    pub fn record_kill_at(&mut self, now: Instant) {
        self.last_kill = now;
    }

    /// Move the last-kill watermark to the current instant.
    pub fn record_kill(&mut self) {
        self.record_kill_at(Instant::now());
    }

    /// Time since start.
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Which limit, if any, is exceeded at `now`.
    pub fn stop_reason_at(&self, now: Instant) -> Option<StopReason> {
        if exceeded(self.policy.total_test_time, self.elapsed_at(now)) {
            return Some(StopReason::TotalTimeExceeded);
        }
        if exceeded(
            self.policy.maximum_time_since_last_kill,
            now.saturating_duration_since(self.last_kill),
        ) {
            return Some(StopReason::NoRecentKill);
        }
        None
    }

    /// Which limit, if any, is exceeded now.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason_at(Instant::now())
    }

    /// True while no limit is exceeded.
    pub fn still_testing(&self) -> bool {
        self.stop_reason().is_none()
    }
}
