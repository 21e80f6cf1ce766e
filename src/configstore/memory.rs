//! In-process config store.
//!
//! Stands in for the replicated configuration cluster in tests and
//! single-machine deployments. A single mutex makes every conditional
//! update trivially atomic. Test hooks inject clock skew and outages.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::core::{
    ChunkId, ChunkRecord, ChunkVersion, LockName, LockToken, Namespace, ProcessId, ShardId,
    WallTime,
};

use super::records::{ChangeLogEntry, LockRecord, LockState, PingRecord};
use super::{ConfigStore, ConfigStoreError};

#[derive(Default)]
struct Collections {
    locks: BTreeMap<LockName, LockRecord>,
    pings: BTreeMap<ProcessId, PingRecord>,
    chunks: BTreeMap<ChunkId, ChunkRecord>,
    changelog: Vec<ChangeLogEntry>,
}

#[derive(Default)]
pub struct MemConfigStore {
    inner: Mutex<Collections>,
    /// Simulated offset of the store's clock from local wall time.
    clock_offset_ms: AtomicI64,
    /// When set, every operation fails as unreachable.
    unreachable: AtomicBool,
}

impl MemConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the store's clock runs `offset_ms` ahead (or behind) of ours.
    pub fn set_clock_offset_ms(&self, offset_ms: i64) {
        self.clock_offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// Toggle a simulated outage.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    /// Overwrite a ping record directly, bypassing the pinger. Tests use
    /// this to simulate a crashed holder whose pings stopped long ago.
    pub fn force_ping(&self, process: ProcessId, ping: WallTime) {
        let mut inner = self.inner.lock().expect("config store lock poisoned");
        inner.pings.insert(process.clone(), PingRecord { process, ping });
    }

    /// Install a lock record directly. Tests use this to seed a holder.
    pub fn force_lock(&self, record: LockRecord) {
        let mut inner = self.inner.lock().expect("config store lock poisoned");
        inner.locks.insert(record.name.clone(), record);
    }

    pub fn changelog(&self) -> Vec<ChangeLogEntry> {
        let inner = self.inner.lock().expect("config store lock poisoned");
        inner.changelog.clone()
    }

    fn check_reachable(&self) -> Result<(), ConfigStoreError> {
        if self.unreachable.load(Ordering::Relaxed) {
            return Err(ConfigStoreError::Unreachable("simulated outage".into()));
        }
        Ok(())
    }
}

impl ConfigStore for MemConfigStore {
    fn now(&self) -> Result<WallTime, ConfigStoreError> {
        self.check_reachable()?;
        Ok(WallTime::now().offset_by_ms(self.clock_offset_ms.load(Ordering::Relaxed)))
    }

    fn find_lock(&self, name: &LockName) -> Result<Option<LockRecord>, ConfigStoreError> {
        self.check_reachable()?;
        let inner = self.inner.lock().expect("config store lock poisoned");
        Ok(inner.locks.get(name).cloned())
    }

    fn try_claim_lock(
        &self,
        record: LockRecord,
        observed_ts: Option<LockToken>,
    ) -> Result<bool, ConfigStoreError> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().expect("config store lock poisoned");
        let claimable = match inner.locks.get(&record.name) {
            None => true,
            Some(current) => {
                current.state == LockState::Free || Some(current.ts) == observed_ts
            }
        };
        if claimable {
            inner.locks.insert(record.name.clone(), record);
        }
        Ok(claimable)
    }

    fn release_lock(&self, name: &LockName, ts: &LockToken) -> Result<bool, ConfigStoreError> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().expect("config store lock poisoned");
        match inner.locks.get_mut(name) {
            Some(current) if current.ts == *ts => {
                current.state = LockState::Free;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn write_ping(&self, record: PingRecord) -> Result<(), ConfigStoreError> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().expect("config store lock poisoned");
        inner.pings.insert(record.process.clone(), record);
        Ok(())
    }

    fn find_ping(&self, process: &ProcessId) -> Result<Option<PingRecord>, ConfigStoreError> {
        self.check_reachable()?;
        let inner = self.inner.lock().expect("config store lock poisoned");
        Ok(inner.pings.get(process).cloned())
    }

    fn max_chunk_version(&self, ns: &Namespace) -> Result<Option<ChunkVersion>, ConfigStoreError> {
        self.check_reachable()?;
        let inner = self.inner.lock().expect("config store lock poisoned");
        Ok(inner
            .chunks
            .values()
            .filter(|c| c.ns == *ns)
            .map(|c| c.lastmod)
            .max())
    }

    fn find_chunk(&self, id: &ChunkId) -> Result<Option<ChunkRecord>, ConfigStoreError> {
        self.check_reachable()?;
        let inner = self.inner.lock().expect("config store lock poisoned");
        Ok(inner.chunks.get(id).cloned())
    }

    fn highest_chunk_for_shard(
        &self,
        ns: &Namespace,
        shard: &ShardId,
    ) -> Result<Option<ChunkRecord>, ConfigStoreError> {
        self.check_reachable()?;
        let inner = self.inner.lock().expect("config store lock poisoned");
        Ok(inner
            .chunks
            .values()
            .filter(|c| c.ns == *ns && c.shard == *shard)
            .max_by_key(|c| c.lastmod)
            .cloned())
    }

    fn set_chunk_owner(
        &self,
        id: &ChunkId,
        shard: &ShardId,
        lastmod: ChunkVersion,
    ) -> Result<(), ConfigStoreError> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().expect("config store lock poisoned");
        if let Some(chunk) = inner.chunks.get_mut(id) {
            chunk.shard = shard.clone();
            chunk.lastmod = lastmod;
        }
        Ok(())
    }

    fn set_chunk_version(
        &self,
        id: &ChunkId,
        lastmod: ChunkVersion,
    ) -> Result<(), ConfigStoreError> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().expect("config store lock poisoned");
        if let Some(chunk) = inner.chunks.get_mut(id) {
            chunk.lastmod = lastmod;
        }
        Ok(())
    }

    fn insert_chunk(&self, record: ChunkRecord) -> Result<(), ConfigStoreError> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().expect("config store lock poisoned");
        inner.chunks.insert(record.id.clone(), record);
        Ok(())
    }

    fn log_change(&self, entry: ChangeLogEntry) -> Result<(), ConfigStoreError> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().expect("config store lock poisoned");
        inner.changelog.push(entry);
        Ok(())
    }
}
