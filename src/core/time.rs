//! Wall-clock primitives.
//!
//! Lock leases, pings and skew math all work in milliseconds since the Unix
//! epoch. `WallTime` is deliberately not monotonic: it models what a remote
//! clock reports, including skew.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WallTime(u64);

impl WallTime {
    pub const ZERO: WallTime = WallTime(0);

    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Elapsed time since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_since(self, earlier: WallTime) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Signed distance to `other` in milliseconds.
    pub fn signed_offset_ms(self, other: WallTime) -> i64 {
        self.0 as i64 - other.0 as i64
    }

    /// Shift by a signed number of milliseconds, clamped at zero.
    pub fn offset_by_ms(self, delta: i64) -> WallTime {
        WallTime(self.0.saturating_add_signed(delta))
    }

    /// Midpoint between two instants, used to estimate the local instant a
    /// remote time read corresponds to.
    pub fn midpoint(self, other: WallTime) -> WallTime {
        WallTime(self.0 / 2 + other.0 / 2 + (self.0 % 2 + other.0 % 2) / 2)
    }
}

impl Add<Duration> for WallTime {
    type Output = WallTime;

    fn add(self, rhs: Duration) -> WallTime {
        WallTime(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Sub<Duration> for WallTime {
    type Output = WallTime;

    fn sub(self, rhs: Duration) -> WallTime {
        WallTime(self.0.saturating_sub(rhs.as_millis() as u64))
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_since_handles_future_earlier() {
        let a = WallTime::from_millis(100);
        let b = WallTime::from_millis(500);
        assert_eq!(b.saturating_since(a), Duration::from_millis(400));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
    }

    #[test]
    fn signed_offset_is_symmetric() {
        let a = WallTime::from_millis(100);
        let b = WallTime::from_millis(130);
        assert_eq!(a.signed_offset_ms(b), -30);
        assert_eq!(b.signed_offset_ms(a), 30);
    }

    #[test]
    fn midpoint_of_adjacent_instants() {
        let a = WallTime::from_millis(10);
        let b = WallTime::from_millis(11);
        assert_eq!(a.midpoint(b).as_millis(), 10);
        assert_eq!(a.midpoint(a), a);
    }
}
