//! Lease-based distributed mutex over the config store.
//!
//! A lock is a record in the config cluster's `locks` collection; holding it
//! means having installed a record with a fresh token under a conditional
//! update. Liveness flows through `lockpings`: a holder whose process has
//! not pinged within `lock_timeout` is presumed dead and its lock can be
//! stolen, but only after two consecutive attempts observe the identical
//! stale witness, so two racing stealers cannot both conclude staleness from
//! one snapshot.

pub mod pinger;

use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::config::Tunables;
use crate::configstore::{ConfigStore, ConfigStoreError, LockRecord, LockState};
use crate::core::{LockName, LockToken, ProcessId, Transience, WallTime};

pub use pinger::Pinger;

#[derive(Debug, Error)]
pub enum DistLockError {
    /// Time reads failed or revealed intolerable skew.
    #[error("config store time not usable: {0}")]
    TimeNotFound(String),

    #[error(transparent)]
    Store(#[from] ConfigStoreError),
}

impl DistLockError {
    pub fn transience(&self) -> Transience {
        match self {
            DistLockError::TimeNotFound(_) => Transience::Unknown,
            DistLockError::Store(err) => err.transience(),
        }
    }
}

/// Outcome of one acquisition attempt. Never retries internally.
pub enum TryLock<'a> {
    Got(DistLockGuard<'a>),
    /// Contended; carries the holder's record for diagnostics.
    Busy(LockRecord),
}

impl TryLock<'_> {
    pub fn is_got(&self) -> bool {
        matches!(self, TryLock::Got(_))
    }
}

/// The stale-holder witness remembered between attempts. A steal is allowed
/// only when a subsequent attempt observes this exact tuple unchanged.
#[derive(Clone, PartialEq)]
struct StaleWitness {
    process: ProcessId,
    ping: WallTime,
    when: WallTime,
    ts: LockToken,
}

struct LockLocal {
    held_ts: Option<LockToken>,
    last_ping_check: Option<StaleWitness>,
    skew_checked: bool,
}

pub struct DistLock {
    store: Arc<dyn ConfigStore>,
    name: LockName,
    process: ProcessId,
    lock_timeout: Duration,
    max_clock_skew: Duration,
    max_net_skew: Duration,
    num_skew_checks: u32,
    local: Mutex<LockLocal>,
}

impl DistLock {
    /// Construction does not acquire and does not touch the store; the
    /// process-wide [`Pinger`] keeps liveness separately.
    pub fn new(
        store: Arc<dyn ConfigStore>,
        name: LockName,
        process: ProcessId,
        tunables: &Tunables,
    ) -> Self {
        Self {
            store,
            name,
            process,
            lock_timeout: tunables.lock_timeout(),
            max_clock_skew: tunables.max_lock_clock_skew(),
            max_net_skew: tunables.max_lock_net_skew(),
            num_skew_checks: tunables.num_lock_skew_checks,
            local: Mutex::new(LockLocal {
                held_ts: None,
                last_ping_check: None,
                skew_checked: false,
            }),
        }
    }

    pub fn name(&self) -> &LockName {
        &self.name
    }

    /// One acquisition attempt.
    pub fn try_lock(&self, why: &str) -> Result<TryLock<'_>, DistLockError> {
        self.ensure_skew_checked()?;

        let current = self.store.find_lock(&self.name)?;
        let observed_ts = match &current {
            None => None,
            Some(rec) if rec.state == LockState::Free => None,
            Some(rec) => {
                // Held (or mid-acquisition): consult the holder's liveness.
                let ping = self
                    .store
                    .find_ping(&rec.process)?
                    .map(|p| p.ping)
                    .unwrap_or(WallTime::ZERO);
                let now = self.store.now()?;
                let unpinged = now.saturating_since(ping);

                if unpinged <= self.lock_timeout {
                    // Live holder; forget any staleness we thought we saw.
                    self.local
                        .lock()
                        .expect("distlock local state poisoned")
                        .last_ping_check = None;
                    return Ok(TryLock::Busy(rec.clone()));
                }

                let witness = StaleWitness {
                    process: rec.process.clone(),
                    ping,
                    when: rec.when,
                    ts: rec.ts,
                };
                let mut local = self.local.lock().expect("distlock local state poisoned");
                if local.last_ping_check.as_ref() != Some(&witness) {
                    // First staleness observation: arm the witness, report
                    // contended. The steal needs a second identical look.
                    local.last_ping_check = Some(witness);
                    return Ok(TryLock::Busy(rec.clone()));
                }
                tracing::info!(
                    lock = %self.name,
                    holder = %rec.process,
                    unpinged_ms = unpinged.as_millis() as u64,
                    "lock holder presumed dead, taking over"
                );
                Some(rec.ts)
            }
        };

        self.claim(why, observed_ts, current)
    }

    fn claim(
        &self,
        why: &str,
        observed_ts: Option<LockToken>,
        observed: Option<LockRecord>,
    ) -> Result<TryLock<'_>, DistLockError> {
        let ts = LockToken::generate();
        let when = self.store.now()?;
        let record = LockRecord {
            name: self.name.clone(),
            state: LockState::Held,
            ts,
            process: self.process.clone(),
            when,
            who: self.who(),
            why: why.to_string(),
        };

        let claimed = self.store.try_claim_lock(record, observed_ts)?;
        if !claimed {
            let other = self.store.find_lock(&self.name)?.or(observed);
            return Ok(match other {
                Some(rec) => TryLock::Busy(rec),
                // Record vanished under us; the next attempt will claim it.
                None => TryLock::Busy(self.synthetic_busy_record(why)),
            });
        }

        // Post-claim verification: the update predicate held, but only the
        // re-read proves our token survived.
        match self.store.find_lock(&self.name)? {
            Some(rec) if rec.ts == ts => {
                let mut local = self.local.lock().expect("distlock local state poisoned");
                local.held_ts = Some(ts);
                local.last_ping_check = None;
                tracing::debug!(lock = %self.name, %ts, why, "distributed lock acquired");
                Ok(TryLock::Got(DistLockGuard {
                    lock: self,
                    released: false,
                }))
            }
            Some(rec) => Ok(TryLock::Busy(rec)),
            None => Ok(TryLock::Busy(self.synthetic_busy_record(why))),
        }
    }

    /// Release if held. A predicate miss means the lock was stolen after our
    /// lease lapsed; the work it protected is invalidated by version checks
    /// elsewhere, so this is not an error.
    pub fn unlock(&self) -> Result<(), DistLockError> {
        let ts = {
            let mut local = self.local.lock().expect("distlock local state poisoned");
            local.held_ts.take()
        };
        let Some(ts) = ts else {
            return Ok(());
        };
        if self.store.release_lock(&self.name, &ts)? {
            tracing::debug!(lock = %self.name, %ts, "distributed lock released");
        } else {
            tracing::info!(lock = %self.name, %ts, "lock already taken over, nothing to release");
        }
        Ok(())
    }

    /// Round-trip-bounded read of the store's clock.
    pub fn remote_time(&self) -> Result<WallTime, DistLockError> {
        let t0 = WallTime::now();
        let remote = self
            .store
            .now()
            .map_err(|err| DistLockError::TimeNotFound(err.to_string()))?;
        let t1 = WallTime::now();
        let rtt = t1.saturating_since(t0);
        if rtt > self.max_net_skew {
            return Err(DistLockError::TimeNotFound(format!(
                "time read round trip {}ms exceeds {}ms",
                rtt.as_millis(),
                self.max_net_skew.as_millis()
            )));
        }
        Ok(remote)
    }

    pub fn is_remote_time_skewed(&self) -> bool {
        self.check_skew().is_err()
    }

    fn ensure_skew_checked(&self) -> Result<(), DistLockError> {
        {
            let local = self.local.lock().expect("distlock local state poisoned");
            if local.skew_checked {
                return Ok(());
            }
        }
        self.check_skew()?;
        self.local
            .lock()
            .expect("distlock local state poisoned")
            .skew_checked = true;
        Ok(())
    }

    /// Probe the store's clock `num_skew_checks` times. The lease model
    /// tolerates `2 * net + clock` total skew; this bounds both terms before
    /// the first acquisition.
    fn check_skew(&self) -> Result<(), DistLockError> {
        let mut offsets: Vec<i64> = Vec::with_capacity(self.num_skew_checks as usize);
        let max_clock_ms = self.max_clock_skew.as_millis() as i64;

        for _ in 0..self.num_skew_checks {
            let t0 = WallTime::now();
            let remote = self
                .store
                .now()
                .map_err(|err| DistLockError::TimeNotFound(err.to_string()))?;
            let t1 = WallTime::now();

            let rtt = t1.saturating_since(t0);
            if rtt > self.max_net_skew {
                return Err(DistLockError::TimeNotFound(format!(
                    "time read round trip {}ms exceeds {}ms",
                    rtt.as_millis(),
                    self.max_net_skew.as_millis()
                )));
            }

            let offset = remote.signed_offset_ms(t0.midpoint(t1));
            if offset.abs() > max_clock_ms {
                return Err(DistLockError::TimeNotFound(format!(
                    "clock offset {offset}ms exceeds {max_clock_ms}ms"
                )));
            }
            for prior in &offsets {
                if (offset - prior).abs() > max_clock_ms {
                    return Err(DistLockError::TimeNotFound(format!(
                        "clock offset spread {}ms exceeds {max_clock_ms}ms",
                        (offset - prior).abs()
                    )));
                }
            }
            offsets.push(offset);
        }
        Ok(())
    }

    fn who(&self) -> String {
        match thread::current().name() {
            Some(name) => format!("{}:{}", self.process, name),
            None => self.process.to_string(),
        }
    }

    fn synthetic_busy_record(&self, why: &str) -> LockRecord {
        LockRecord {
            name: self.name.clone(),
            state: LockState::Contested,
            ts: LockToken::generate(),
            process: self.process.clone(),
            when: WallTime::ZERO,
            who: String::new(),
            why: why.to_string(),
        }
    }
}

/// Scoped acquisition: releases on every exit path. Prefer `release` when
/// the caller can act on an unlock failure; drop is best effort.
pub struct DistLockGuard<'a> {
    lock: &'a DistLock,
    released: bool,
}

impl DistLockGuard<'_> {
    pub fn release(mut self) -> Result<(), DistLockError> {
        self.released = true;
        self.lock.unlock()
    }
}

impl Drop for DistLockGuard<'_> {
    fn drop(&mut self) {
        if !self.released
            && let Err(err) = self.lock.unlock()
        {
            tracing::warn!(lock = %self.lock.name, "lock release on drop failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configstore::MemConfigStore;
    use crate::core::ShardId;

    fn setup() -> (Arc<MemConfigStore>, Tunables, ProcessId, ProcessId) {
        let store = Arc::new(MemConfigStore::new());
        let tunables = Tunables::default();
        let a = ProcessId::generate(&ShardId::new("a:1").unwrap());
        let b = ProcessId::generate(&ShardId::new("b:1").unwrap());
        (store, tunables, a, b)
    }

    fn dist_lock(
        store: &Arc<MemConfigStore>,
        process: &ProcessId,
        tunables: &Tunables,
    ) -> DistLock {
        DistLock::new(
            Arc::clone(store) as Arc<dyn ConfigStore>,
            LockName::new("test.foo").unwrap(),
            process.clone(),
            tunables,
        )
    }

    fn keep_alive(store: &MemConfigStore, process: &ProcessId) {
        store.force_ping(process.clone(), store.now().unwrap());
    }

    #[test]
    fn second_acquirer_sees_busy_with_holder_record() {
        let (store, tunables, a, b) = setup();
        let lock_a = dist_lock(&store, &a, &tunables);
        let lock_b = dist_lock(&store, &b, &tunables);
        keep_alive(&store, &a);

        let got = lock_a.try_lock("migrate").unwrap();
        assert!(got.is_got());

        match lock_b.try_lock("migrate").unwrap() {
            TryLock::Busy(rec) => {
                assert_eq!(rec.process, a);
                assert_eq!(rec.state, LockState::Held);
                assert_eq!(rec.why, "migrate");
            }
            TryLock::Got(_) => panic!("lock should be contended"),
        }
    }

    #[test]
    fn lock_is_reacquirable_after_release() {
        let (store, tunables, a, b) = setup();
        let lock_a = dist_lock(&store, &a, &tunables);
        let lock_b = dist_lock(&store, &b, &tunables);
        keep_alive(&store, &a);

        match lock_a.try_lock("first").unwrap() {
            TryLock::Got(guard) => guard.release().unwrap(),
            TryLock::Busy(_) => panic!("lock should be free"),
        }
        assert!(lock_b.try_lock("second").unwrap().is_got());
    }

    #[test]
    fn guard_drop_releases_the_lock() {
        let (store, tunables, a, b) = setup();
        let lock_a = dist_lock(&store, &a, &tunables);
        let lock_b = dist_lock(&store, &b, &tunables);
        keep_alive(&store, &a);

        {
            let _guard = lock_a.try_lock("scoped").unwrap();
        }
        assert!(lock_b.try_lock("after").unwrap().is_got());
    }

    #[test]
    fn stale_holder_requires_two_consecutive_observations() {
        let (store, tunables, a, b) = setup();
        let lock_a = dist_lock(&store, &a, &tunables);
        let lock_b = dist_lock(&store, &b, &tunables);

        // Holder acquires, then its pings stop twenty minutes ago.
        keep_alive(&store, &a);
        let guard_a = match lock_a.try_lock("doomed").unwrap() {
            TryLock::Got(guard) => guard,
            TryLock::Busy(_) => panic!("lock should be free"),
        };
        let stale = store.now().unwrap() - Duration::from_secs(20 * 60);
        store.force_ping(a.clone(), stale);

        // First look arms the witness, second steals.
        assert!(!lock_b.try_lock("takeover").unwrap().is_got());
        assert!(lock_b.try_lock("takeover").unwrap().is_got());

        // The original holder's release is a silent no-op now.
        drop(guard_a);
        let rec = store
            .find_lock(&LockName::new("test.foo").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(rec.state, LockState::Held);
        assert_eq!(rec.process, b);
    }

    #[test]
    fn refreshed_ping_between_observations_blocks_the_steal() {
        let (store, tunables, a, b) = setup();
        let lock_a = dist_lock(&store, &a, &tunables);
        let lock_b = dist_lock(&store, &b, &tunables);

        keep_alive(&store, &a);
        let _guard = lock_a.try_lock("holder").unwrap();
        let stale = store.now().unwrap() - Duration::from_secs(20 * 60);
        store.force_ping(a.clone(), stale);

        assert!(!lock_b.try_lock("takeover").unwrap().is_got());
        // Holder comes back before the second look: witness resets.
        keep_alive(&store, &a);
        assert!(!lock_b.try_lock("takeover").unwrap().is_got());

        // Goes stale again at a different instant: still needs two looks.
        let stale2 = store.now().unwrap() - Duration::from_secs(30 * 60);
        store.force_ping(a.clone(), stale2);
        assert!(!lock_b.try_lock("takeover").unwrap().is_got());
        assert!(lock_b.try_lock("takeover").unwrap().is_got());
    }

    #[test]
    fn missing_ping_record_counts_as_stale() {
        let (store, tunables, a, b) = setup();
        let lock_b = dist_lock(&store, &b, &tunables);

        // A holder that never pinged (crashed before its first write).
        store.force_lock(LockRecord {
            name: LockName::new("test.foo").unwrap(),
            state: LockState::Held,
            ts: LockToken::generate(),
            process: a.clone(),
            when: WallTime::from_millis(1),
            who: "a".into(),
            why: "crashed".into(),
        });

        assert!(!lock_b.try_lock("takeover").unwrap().is_got());
        assert!(lock_b.try_lock("takeover").unwrap().is_got());
    }

    #[test]
    fn excessive_clock_skew_fails_acquisition() {
        let (store, tunables, a, _) = setup();
        store.set_clock_offset_ms(tunables.max_lock_clock_skew_ms as i64 + 60_000);
        let lock = dist_lock(&store, &a, &tunables);
        match lock.try_lock("skewed") {
            Err(DistLockError::TimeNotFound(_)) => {}
            other => panic!("expected TimeNotFound, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn store_outage_surfaces_as_error_not_busy() {
        let (store, tunables, a, _) = setup();
        let lock = dist_lock(&store, &a, &tunables);
        // Pass the skew gate first, then break the store.
        assert!(lock.try_lock("warmup").unwrap().is_got());
        lock.unlock().unwrap();
        store.set_unreachable(true);
        assert!(lock.try_lock("down").is_err());
    }
}
