//! Shard daemon wiring.
//!
//! `ShardNode` owns everything one data-bearing process carries: its
//! identity, the local store, the donor and recipient migration singletons,
//! the per-namespace ownership versions, the config-store handle, and the
//! background lock pinger. Command handlers receive the node; nothing in
//! the crate reaches for globals.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

use crate::config::Tunables;
use crate::configstore::ConfigStore;
use crate::core::{ChunkVersion, LockName, Namespace, ProcessId, ShardId};
use crate::distlock::{DistLock, Pinger};
use crate::migrate::{MigrateFromStatus, MigrateStatus};
use crate::storage::LocalStore;

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("version bump for {ns} not monotonic: current {current}, proposed {proposed}")]
    NotMonotonic {
        ns: Namespace,
        current: ChunkVersion,
        proposed: ChunkVersion,
    },
}

/// Per-namespace in-memory ownership versions.
#[derive(Default)]
struct ShardVersions {
    map: RwLock<BTreeMap<Namespace, ChunkVersion>>,
}

impl ShardVersions {
    fn get(&self, ns: &Namespace) -> ChunkVersion {
        let map = self.map.read().expect("version map poisoned");
        map.get(ns).copied().unwrap_or(ChunkVersion::ZERO)
    }

    fn set(&self, ns: &Namespace, version: ChunkVersion) -> Result<(), VersionError> {
        let mut map = self.map.write().expect("version map poisoned");
        let current = map.get(ns).copied().unwrap_or(ChunkVersion::ZERO);
        if version <= current {
            return Err(VersionError::NotMonotonic {
                ns: ns.clone(),
                current,
                proposed: version,
            });
        }
        map.insert(ns.clone(), version);
        Ok(())
    }

    fn reset(&self, ns: &Namespace) {
        let mut map = self.map.write().expect("version map poisoned");
        map.insert(ns.clone(), ChunkVersion::ZERO);
    }
}

pub struct ShardNode {
    shard: ShardId,
    process: ProcessId,
    tunables: Tunables,
    store: Arc<LocalStore>,
    donor: Arc<MigrateFromStatus>,
    recipient: Arc<MigrateStatus>,
    versions: ShardVersions,
    config_store: Arc<dyn ConfigStore>,
    pinger: Mutex<Option<Pinger>>,
    dist_locks: Mutex<BTreeMap<LockName, Arc<DistLock>>>,
}

impl ShardNode {
    /// Build a node and wire the storage write path into the donor capture
    /// hook. The lock pinger starts immediately and runs for the node's
    /// lifetime.
    pub fn new(
        shard: ShardId,
        config_store: Arc<dyn ConfigStore>,
        tunables: Tunables,
    ) -> Arc<Self> {
        let process = ProcessId::generate(&shard);
        let store = Arc::new(LocalStore::new());
        let donor = Arc::new(MigrateFromStatus::new());

        {
            let donor = Arc::clone(&donor);
            store.set_observer(Arc::new(move |store, kind, ns, doc, predicate| {
                donor.log_op(store, kind, ns, doc, predicate);
            }));
        }

        let pinger = Pinger::spawn(
            Arc::clone(&config_store),
            process.clone(),
            tunables.lock_ping(),
        );

        Arc::new(Self {
            shard,
            process,
            tunables,
            store,
            donor,
            recipient: Arc::new(MigrateStatus::new()),
            versions: ShardVersions::default(),
            config_store,
            pinger: Mutex::new(Some(pinger)),
            dist_locks: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    pub fn process(&self) -> &ProcessId {
        &self.process
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn donor(&self) -> &MigrateFromStatus {
        &self.donor
    }

    pub fn recipient(&self) -> &MigrateStatus {
        &self.recipient
    }

    pub fn recipient_arc(&self) -> Arc<MigrateStatus> {
        Arc::clone(&self.recipient)
    }

    pub fn config_store(&self) -> Arc<dyn ConfigStore> {
        Arc::clone(&self.config_store)
    }

    /// The distributed lock for `name`, one instance per name for the life
    /// of the process. Reuse matters: a takeover of an expired lock needs
    /// two consecutive attempts to observe the same stale witness, and that
    /// witness lives in the lock instance.
    pub fn dist_lock(&self, name: LockName) -> Arc<DistLock> {
        let mut locks = self.dist_locks.lock().expect("dist lock cache poisoned");
        Arc::clone(locks.entry(name.clone()).or_insert_with(|| {
            Arc::new(DistLock::new(
                Arc::clone(&self.config_store),
                name,
                self.process.clone(),
                &self.tunables,
            ))
        }))
    }

    /// This node's in-memory ownership version for `ns`.
    pub fn version(&self, ns: &Namespace) -> ChunkVersion {
        self.versions.get(ns)
    }

    /// Raise the ownership version; refuses to go backwards.
    pub fn set_version(&self, ns: &Namespace, version: ChunkVersion) -> Result<(), VersionError> {
        self.versions.set(ns, version)
    }

    /// The shard no longer owns any chunk of `ns`.
    pub fn reset_version(&self, ns: &Namespace) {
        self.versions.reset(ns)
    }

    /// Storage-layer readers consult this to serialize against an ownership
    /// flip in progress.
    pub fn in_critical_migrate_section(&self) -> bool {
        self.donor.in_critical_section()
    }

    /// Stop background work. Also happens implicitly on drop.
    pub fn shutdown(&self) {
        let pinger = self.pinger.lock().expect("pinger slot poisoned").take();
        if let Some(pinger) = pinger {
            pinger.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configstore::MemConfigStore;
    use crate::core::Doc;
    use serde_json::json;

    fn node() -> Arc<ShardNode> {
        ShardNode::new(
            ShardId::new("127.0.0.1:0").unwrap(),
            Arc::new(MemConfigStore::new()),
            Tunables::default(),
        )
    }

    #[test]
    fn versions_are_monotonic_with_explicit_reset() {
        let node = node();
        let ns = Namespace::parse("test.foo").unwrap();
        assert_eq!(node.version(&ns), ChunkVersion::ZERO);

        node.set_version(&ns, ChunkVersion::from_raw(3)).unwrap();
        assert!(node.set_version(&ns, ChunkVersion::from_raw(3)).is_err());
        assert!(node.set_version(&ns, ChunkVersion::from_raw(2)).is_err());
        node.set_version(&ns, ChunkVersion::from_raw(4)).unwrap();

        node.reset_version(&ns);
        assert_eq!(node.version(&ns), ChunkVersion::ZERO);
    }

    #[test]
    fn data_path_writes_feed_the_capture_hook() {
        let node = node();
        let ns = Namespace::parse("test.foo").unwrap();
        node.donor()
            .start(
                ns.clone(),
                Doc::from_value(json!({"k": 0})).unwrap(),
                Doc::from_value(json!({"k": 100})).unwrap(),
            )
            .unwrap();

        node.store()
            .insert(&ns, Doc::from_value(json!({"_id": 1, "k": 5})).unwrap());
        let batch = node
            .donor()
            .transfer_mods(node.store(), 1 << 20)
            .unwrap();
        assert_eq!(batch.reload.len(), 1);
        node.donor().done();
    }

    #[test]
    fn critical_section_flag_is_visible_through_the_node() {
        let node = node();
        assert!(!node.in_critical_migrate_section());
        node.donor().set_in_critical_section(true);
        assert!(node.in_critical_migrate_section());
        node.donor().set_in_critical_section(false);
    }
}
