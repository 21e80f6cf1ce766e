//! Migration and lock tunables.
//!
//! Defaults follow the lease model: a lock lease survives `lock_timeout`
//! without a ping, the pinger runs `lock_skew_factor` times per lease, and
//! the tolerated network/clock skew is one ping interval each.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const LOCK_TIMEOUT_MS: u64 = 15 * 60 * 1000;
pub const LOCK_SKEW_FACTOR: u64 = 30;
pub const NUM_LOCK_SKEW_CHECKS: u32 = 3;
pub const TRANSFER_MODS_BATCH_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// How long a lock may go unpinged before a new attempt steals it.
    pub lock_timeout_ms: u64,
    /// Interval between lock pings. Defaults to `lock_timeout / 30`.
    pub lock_ping_ms: u64,
    /// Maximum tolerated round trip for a config-store time read.
    pub max_lock_net_skew_ms: u64,
    /// Maximum tolerated clock offset spread across time reads.
    pub max_lock_clock_skew_ms: u64,
    /// Number of time probes before the first lock acquisition.
    pub num_lock_skew_checks: u32,
    /// Transfer batch budget in bytes.
    pub transfer_mods_batch_bytes: u64,
    /// Donor-side interval between recipient status polls.
    pub steady_poll_interval_ms: u64,
    /// Donor-side ceiling on status polls (one day at the default interval).
    pub steady_poll_max_iterations: u32,
    /// Recipient-side sleep between steady-state change polls.
    pub recipient_steady_sleep_ms: u64,
    /// How long the recipient waits for the final drain after commit starts.
    pub commit_wait_ms: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            lock_timeout_ms: LOCK_TIMEOUT_MS,
            lock_ping_ms: LOCK_TIMEOUT_MS / LOCK_SKEW_FACTOR,
            max_lock_net_skew_ms: LOCK_TIMEOUT_MS / LOCK_SKEW_FACTOR,
            max_lock_clock_skew_ms: LOCK_TIMEOUT_MS / LOCK_SKEW_FACTOR,
            num_lock_skew_checks: NUM_LOCK_SKEW_CHECKS,
            transfer_mods_batch_bytes: TRANSFER_MODS_BATCH_BYTES,
            steady_poll_interval_ms: 1_000,
            steady_poll_max_iterations: 86_400,
            recipient_steady_sleep_ms: 20,
            commit_wait_ms: 86_400_000,
        }
    }
}

impl Tunables {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_ping(&self) -> Duration {
        Duration::from_millis(self.lock_ping_ms)
    }

    pub fn max_lock_net_skew(&self) -> Duration {
        Duration::from_millis(self.max_lock_net_skew_ms)
    }

    pub fn max_lock_clock_skew(&self) -> Duration {
        Duration::from_millis(self.max_lock_clock_skew_ms)
    }

    pub fn steady_poll_interval(&self) -> Duration {
        Duration::from_millis(self.steady_poll_interval_ms)
    }

    pub fn recipient_steady_sleep(&self) -> Duration {
        Duration::from_millis(self.recipient_steady_sleep_ms)
    }

    pub fn commit_wait(&self) -> Duration {
        Duration::from_millis(self.commit_wait_ms)
    }
}
