//! Background lock pinger.
//!
//! One pinger per process, shared by every distributed lock the process
//! takes: it keeps `lockpings[process].ping` fresh so remote observers can
//! tell a live holder from a dead one. Ping failures only shorten the lease
//! as seen remotely, so they are logged and swallowed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::configstore::{ConfigStore, PingRecord};
use crate::core::{ProcessId, WallTime};

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

pub struct Pinger {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    process: ProcessId,
}

impl Pinger {
    pub fn spawn(store: Arc<dyn ConfigStore>, process: ProcessId, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let join = {
            let shutdown = Arc::clone(&shutdown);
            let process = process.clone();
            thread::spawn(move || run_ping_loop(store, process, interval, shutdown))
        };
        Self {
            shutdown,
            join: Some(join),
            process,
        }
    }

    pub fn process(&self) -> &ProcessId {
        &self.process
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_ping_loop(
    store: Arc<dyn ConfigStore>,
    process: ProcessId,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        write_ping(store.as_ref(), &process);

        let mut slept = Duration::ZERO;
        while slept < interval {
            if shutdown.load(Ordering::Relaxed) {
                // One final write so the lease outlives a clean shutdown by
                // a full timeout rather than whatever was left of it.
                write_ping(store.as_ref(), &process);
                return;
            }
            let step = SHUTDOWN_POLL.min(interval - slept);
            thread::sleep(step);
            slept += step;
        }
    }
}

fn write_ping(store: &dyn ConfigStore, process: &ProcessId) {
    let ping = match store.now() {
        Ok(now) => now,
        Err(err) => {
            tracing::warn!(process = %process, "lock ping time read failed: {err}");
            WallTime::now()
        }
    };
    if let Err(err) = store.write_ping(PingRecord {
        process: process.clone(),
        ping,
    }) {
        tracing::warn!(process = %process, "lock ping write failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configstore::MemConfigStore;
    use crate::core::ShardId;

    #[test]
    fn pinger_writes_and_refreshes_pings() {
        let store = Arc::new(MemConfigStore::new());
        let process = ProcessId::generate(&ShardId::new("a:1").unwrap());
        let pinger = Pinger::spawn(
            Arc::clone(&store) as Arc<dyn ConfigStore>,
            process.clone(),
            Duration::from_millis(10),
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let first = loop {
            if let Some(rec) = store.find_ping(&process).unwrap() {
                break rec;
            }
            assert!(std::time::Instant::now() < deadline, "no ping written");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(first.process, process);

        pinger.shutdown();
        assert!(store.find_ping(&process).unwrap().is_some());
    }

    #[test]
    fn pinger_survives_store_outage() {
        let store = Arc::new(MemConfigStore::new());
        store.set_unreachable(true);
        let process = ProcessId::generate(&ShardId::new("a:1").unwrap());
        let pinger = Pinger::spawn(
            Arc::clone(&store) as Arc<dyn ConfigStore>,
            process.clone(),
            Duration::from_millis(10),
        );
        thread::sleep(Duration::from_millis(30));
        store.set_unreachable(false);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while store.find_ping(&process).unwrap().is_none() {
            assert!(std::time::Instant::now() < deadline, "pinger never recovered");
            thread::sleep(Duration::from_millis(5));
        }
        pinger.shutdown();
    }
}
