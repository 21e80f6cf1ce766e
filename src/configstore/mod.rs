//! Client interface to the replicated configuration cluster.
//!
//! The cluster itself (replication, durability, transport) is outside this
//! crate; everything the migration core needs from it is behind the
//! [`ConfigStore`] trait. The operations are deliberately record-shaped
//! rather than generic CRUD: conditional predicated updates are the only
//! write primitive the lock protocol relies on, and implementations over a
//! replicated cluster must not report such an update as applied unless a
//! strict majority acknowledged it.

pub mod memory;
pub mod records;

use thiserror::Error;

use crate::core::{
    ChunkId, ChunkRecord, ChunkVersion, LockName, LockToken, Namespace, ProcessId, ShardId,
    Transience, WallTime,
};

pub use memory::MemConfigStore;
pub use records::{ChangeLogEntry, LockRecord, LockState, PingRecord};

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("config store unreachable: {0}")]
    Unreachable(String),
}

impl ConfigStoreError {
    pub fn transience(&self) -> Transience {
        match self {
            ConfigStoreError::Unreachable(_) => Transience::Retryable,
        }
    }
}

type Result<T> = std::result::Result<T, ConfigStoreError>;

pub trait ConfigStore: Send + Sync {
    /// Server-side wall-clock read.
    fn now(&self) -> Result<WallTime>;

    // --- locks ---

    fn find_lock(&self, name: &LockName) -> Result<Option<LockRecord>>;

    /// Conditionally install `record` (with `state = Held`) for its name.
    ///
    /// The predicate is: no current record, or the current record has
    /// `state = Free`, or its `ts` equals `observed_ts`. The update must be
    /// atomic at the store; returns whether the predicate held and the write
    /// was applied (majority-acknowledged on a replicated store).
    fn try_claim_lock(&self, record: LockRecord, observed_ts: Option<LockToken>) -> Result<bool>;

    /// Set `state = Free` where the current record's `ts` equals `ts`.
    /// Returns whether the predicate held; a miss means the lock was stolen.
    fn release_lock(&self, name: &LockName, ts: &LockToken) -> Result<bool>;

    // --- lock pings ---

    fn write_ping(&self, record: PingRecord) -> Result<()>;

    fn find_ping(&self, process: &ProcessId) -> Result<Option<PingRecord>>;

    // --- chunks ---

    /// Highest `lastmod` across all chunks of `ns`.
    fn max_chunk_version(&self, ns: &Namespace) -> Result<Option<ChunkVersion>>;

    fn find_chunk(&self, id: &ChunkId) -> Result<Option<ChunkRecord>>;

    /// The still-owned chunk of `ns` on `shard` with the highest `lastmod`.
    fn highest_chunk_for_shard(
        &self,
        ns: &Namespace,
        shard: &ShardId,
    ) -> Result<Option<ChunkRecord>>;

    /// Flip a chunk's owner and stamp its new version.
    fn set_chunk_owner(&self, id: &ChunkId, shard: &ShardId, lastmod: ChunkVersion) -> Result<()>;

    /// Bump a chunk's version without changing its owner.
    fn set_chunk_version(&self, id: &ChunkId, lastmod: ChunkVersion) -> Result<()>;

    fn insert_chunk(&self, record: ChunkRecord) -> Result<()>;

    // --- audit ---

    fn log_change(&self, entry: ChangeLogEntry) -> Result<()>;
}
