//! EngineConfig - engine / control / scheduler の調整値
//!
//! TOML の `[engine]` セクションからそのまま読めるように `Deserialize` + `#[serde(default)]`。
//! 時間はすべて秒（poll 間隔だけミリ秒）。

use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lease expiry, counted from acquisition or the latest renewal.
    /// A running step renews its lease every third of this.
    pub lease_ttl_secs: u64,
    /// How long `step()` waits on a held lock before calling it contention.
    pub step_lock_timeout_secs: u64,
    pub kill_lock_timeout_secs: u64,
    /// retry / hold / resume
    pub control_lock_timeout_secs: u64,
    pub lock_poll_interval_ms: u64,
    /// Sleep between iterations of the foreground `Engine::run` loop.
    pub run_poll_interval_secs: u64,
    /// 0 = sequential scheduler pass. N > 0 = experimental pool of N steps.
    pub step_workers: usize,
    /// Requesting user for broker ranking.
    pub user: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 300,
            step_lock_timeout_secs: 0,
            kill_lock_timeout_secs: 120,
            control_lock_timeout_secs: 10,
            lock_poll_interval_ms: 1000,
            run_poll_interval_secs: 10,
            step_workers: 0,
            user: std::env::var("USER").unwrap_or_else(|_| "bobbin".to_string()),
        }
    }
}

impl EngineConfig {
    pub fn lease_ttl(&self) -> Duration {
        secs(self.lease_ttl_secs)
    }

    pub fn step_lock_timeout(&self) -> Duration {
        secs(self.step_lock_timeout_secs)
    }

    pub fn kill_lock_timeout(&self) -> Duration {
        secs(self.kill_lock_timeout_secs)
    }

    pub fn control_lock_timeout(&self) -> Duration {
        secs(self.control_lock_timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.lock_poll_interval_ms.max(1))
    }

    pub fn run_poll_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.run_poll_interval_secs)
    }
}

fn secs(n: u64) -> Duration {
    Duration::seconds(n.min(u64::from(u32::MAX)) as i64)
}
