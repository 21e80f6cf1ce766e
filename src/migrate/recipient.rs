//! Recipient-side migration state machine.
//!
//! A worker thread clones the incoming range, copies index specs, catches up
//! on buffered changes, then tails the donor until the donor's critical
//! section asks it to commit. Handlers observe progress through `status`
//! and drive the final transition through `start_commit`.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;

use crate::core::{Doc, KeyRange, Namespace};
use crate::rpc::ShardClient;
use crate::storage::LocalStore;

use super::donor::TransferBatch;

#[derive(Debug, Error)]
pub enum RecipientError {
    #[error("migrate already in progress")]
    AlreadyActive,

    #[error(transparent)]
    Core(#[from] crate::core::CoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateState {
    Ready,
    Clone,
    Catchup,
    Steady,
    CommitStart,
    Done,
    Fail,
}

impl MigrateState {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrateState::Ready => "ready",
            MigrateState::Clone => "clone",
            MigrateState::Catchup => "catchup",
            MigrateState::Steady => "steady",
            MigrateState::CommitStart => "commitStart",
            MigrateState::Done => "done",
            MigrateState::Fail => "fail",
        }
    }
}

struct RecipientInner {
    active: bool,
    state: MigrateState,
    ns: Option<Namespace>,
    from: Option<String>,
    range: Option<KeyRange>,
    cloned: u64,
    catchup: u64,
    steady: u64,
    errmsg: String,
}

impl RecipientInner {
    const fn idle() -> Self {
        Self {
            active: false,
            state: MigrateState::Ready,
            ns: None,
            from: None,
            range: None,
            cloned: 0,
            catchup: 0,
            steady: 0,
            errmsg: String::new(),
        }
    }
}

/// Process-wide recipient migration state. One instance per shard daemon.
pub struct MigrateStatus {
    inner: Mutex<RecipientInner>,
    changed: Condvar,
}

impl Default for MigrateStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrateStatus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RecipientInner::idle()),
            changed: Condvar::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().expect("recipient state poisoned").active
    }

    /// Arm for one incoming migration. Rejected while one is in flight.
    pub fn prepare(
        &self,
        ns: Namespace,
        from: String,
        min: Doc,
        max: Doc,
    ) -> Result<(), RecipientError> {
        let range = KeyRange::new(min, max)?;
        let mut inner = self.inner.lock().expect("recipient state poisoned");
        if inner.active {
            return Err(RecipientError::AlreadyActive);
        }
        *inner = RecipientInner::idle();
        inner.active = true;
        inner.state = MigrateState::Ready;
        inner.ns = Some(ns);
        inner.from = Some(from);
        inner.range = Some(range);
        Ok(())
    }

    pub fn state(&self) -> MigrateState {
        self.inner.lock().expect("recipient state poisoned").state
    }

    /// Read-only snapshot for `_recvChunkStatus`.
    pub fn status(&self) -> Doc {
        let inner = self.inner.lock().expect("recipient state poisoned");
        let mut doc = Doc::new();
        doc.insert("active", json!(inner.active));
        if !inner.active && inner.ns.is_none() {
            return doc;
        }
        if let Some(ns) = &inner.ns {
            doc.insert("ns", json!(ns.as_str()));
        }
        if let Some(from) = &inner.from {
            doc.insert("from", json!(from));
        }
        if let Some(range) = &inner.range {
            doc.insert("min", range.min.clone().into_value());
            doc.insert("max", range.max.clone().into_value());
        }
        doc.insert("state", json!(inner.state.as_str()));
        if !inner.errmsg.is_empty() {
            doc.insert("errmsg", json!(inner.errmsg.clone()));
        }
        doc.insert(
            "counts",
            json!({
                "cloned": inner.cloned,
                "catchup": inner.catchup,
                "steady": inner.steady,
            }),
        );
        doc
    }

    /// Ask the worker to finish: STEADY becomes COMMIT_START, then wait for
    /// the final drain to land DONE. Returns whether DONE was reached.
    pub fn start_commit(&self, deadline: Duration) -> bool {
        let mut inner = self.inner.lock().expect("recipient state poisoned");
        if inner.state != MigrateState::Steady {
            return false;
        }
        inner.state = MigrateState::CommitStart;
        self.changed.notify_all();

        let start = Instant::now();
        while inner.state != MigrateState::Done {
            if inner.state == MigrateState::Fail {
                return false;
            }
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                tracing::error!("migration commit never finished");
                return false;
            }
            let (guard, _timeout) = self
                .changed
                .wait_timeout(inner, deadline - elapsed)
                .expect("recipient state poisoned");
            inner = guard;
        }
        true
    }

    /// Abort a prepared migration whose worker never started.
    pub fn fail_to_start(&self, errmsg: &str) {
        let mut inner = self.inner.lock().expect("recipient state poisoned");
        inner.state = MigrateState::Fail;
        inner.errmsg = errmsg.to_string();
        inner.active = false;
        self.changed.notify_all();
    }

    /// Worker entry point: runs the clone/catchup/steady pipeline, records
    /// FAIL on any error, and always clears `active` on exit.
    pub fn go(&self, store: &LocalStore, steady_sleep: Duration) {
        if let Err(errmsg) = self.run(store, steady_sleep) {
            let mut inner = self.inner.lock().expect("recipient state poisoned");
            inner.state = MigrateState::Fail;
            inner.errmsg = errmsg.clone();
            tracing::warn!(errmsg = %inner.errmsg, "incoming migration failed");
        }
        let mut inner = self.inner.lock().expect("recipient state poisoned");
        inner.active = false;
        self.changed.notify_all();
    }

    fn run(&self, store: &LocalStore, steady_sleep: Duration) -> Result<(), String> {
        let (ns, from, range) = {
            let inner = self.inner.lock().expect("recipient state poisoned");
            if !inner.active || inner.state != MigrateState::Ready {
                return Err("worker started without prepare".into());
            }
            let ns = inner.ns.clone().ok_or("missing ns")?;
            let from = inner.from.clone().ok_or("missing donor address")?;
            let range = inner.range.clone().ok_or("missing range")?;
            (ns, from, range)
        };

        let donor = ShardClient::new(from.clone());
        donor
            .ping()
            .map_err(|err| format!("donor {from} unreachable: {err}"))?;

        // CLONE: pull the initial range through the donor's query path.
        self.set_state(MigrateState::Clone);
        let docs = donor
            .range_query(&ns, &range)
            .map_err(|err| format!("initial clone query failed: {err}"))?;
        store.with_collection_write(&ns, |coll| {
            for doc in docs {
                let Some(id) = doc.id() else { continue };
                coll.insert(id, doc);
                self.bump_cloned();
            }
        });

        // Index copy.
        let indexes = donor
            .list_indexes(&ns)
            .map_err(|err| format!("index fetch failed: {err}"))?;
        for spec in indexes {
            store.add_index(&ns, spec);
        }

        // CATCHUP: drain buffered changes until a batch comes back empty.
        self.set_state(MigrateState::Catchup);
        loop {
            let batch = donor
                .transfer_mods()
                .map_err(|err| format!("_transferMods failed in catchup: {err}"))?;
            if batch.is_empty() {
                break;
            }
            let applied = apply(store, &ns, &batch);
            self.bump_catchup(applied);
        }

        // STEADY: tail the donor until the coordinator starts the commit,
        // then drain one final batch. The donor accepts no writes once its
        // critical section is up, so that batch is the last word.
        self.set_state(MigrateState::Steady);
        loop {
            if self.wait_for_commit(steady_sleep) {
                break;
            }
            let batch = donor
                .transfer_mods()
                .map_err(|err| format!("_transferMods failed in steady state: {err}"))?;
            if !batch.is_empty() {
                let applied = apply(store, &ns, &batch);
                self.bump_steady(applied);
            }
        }

        let batch = donor
            .transfer_mods()
            .map_err(|err| format!("final drain failed: {err}"))?;
        if !batch.is_empty() {
            let applied = apply(store, &ns, &batch);
            self.bump_steady(applied);
        }

        self.set_state(MigrateState::Done);
        Ok(())
    }

    fn set_state(&self, state: MigrateState) {
        let mut inner = self.inner.lock().expect("recipient state poisoned");
        inner.state = state;
        self.changed.notify_all();
    }

    /// Sleep for one steady poll, waking early if commit starts. Returns
    /// whether the commit has started.
    fn wait_for_commit(&self, steady_sleep: Duration) -> bool {
        let inner = self.inner.lock().expect("recipient state poisoned");
        if inner.state == MigrateState::CommitStart {
            return true;
        }
        let (guard, _timeout) = self
            .changed
            .wait_timeout(inner, steady_sleep)
            .expect("recipient state poisoned");
        guard.state == MigrateState::CommitStart
    }

    fn bump_cloned(&self) {
        self.inner.lock().expect("recipient state poisoned").cloned += 1;
    }

    fn bump_catchup(&self, n: u64) {
        self.inner.lock().expect("recipient state poisoned").catchup += n;
    }

    fn bump_steady(&self, n: u64) {
        self.inner.lock().expect("recipient state poisoned").steady += n;
    }
}

/// Apply one change batch under a single collection write lock: upsert every
/// reloaded document, delete every shipped id. Returns documents touched.
/// Idempotent: re-applying a batch leaves the collection unchanged.
pub fn apply(store: &LocalStore, ns: &Namespace, batch: &TransferBatch) -> u64 {
    store.with_collection_write(ns, |coll| {
        let mut touched = 0u64;
        for doc in &batch.reload {
            let Some(id) = doc.id() else {
                tracing::warn!(ns = %ns, "reload doc without _id dropped");
                continue;
            };
            coll.insert(id, doc.clone());
            touched += 1;
        }
        for id in &batch.deleted {
            // Ids the recipient never saw are a no-op by design: the donor
            // cannot range-filter deletes.
            coll.remove(id);
            touched += 1;
        }
        touched
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DocId;
    use serde_json::json;
    use std::sync::Arc;

    fn ns() -> Namespace {
        Namespace::parse("test.foo").unwrap()
    }

    fn doc(v: serde_json::Value) -> Doc {
        Doc::from_value(v).unwrap()
    }

    #[test]
    fn prepare_rejects_concurrent_migrations() {
        let status = MigrateStatus::new();
        status
            .prepare(ns(), "d:1".into(), doc(json!({"k": 0})), doc(json!({"k": 9})))
            .unwrap();
        assert!(matches!(
            status.prepare(ns(), "d:1".into(), doc(json!({"k": 0})), doc(json!({"k": 9}))),
            Err(RecipientError::AlreadyActive)
        ));
    }

    #[test]
    fn status_reports_fields_and_counts() {
        let status = MigrateStatus::new();
        let snapshot = status.status();
        assert_eq!(snapshot.get("active"), Some(&json!(false)));

        status
            .prepare(ns(), "d:1".into(), doc(json!({"k": 0})), doc(json!({"k": 9})))
            .unwrap();
        let snapshot = status.status();
        assert_eq!(snapshot.get("active"), Some(&json!(true)));
        assert_eq!(snapshot.get("ns"), Some(&json!("test.foo")));
        assert_eq!(snapshot.get("state"), Some(&json!("ready")));
        assert_eq!(
            snapshot.get("counts"),
            Some(&json!({"cloned": 0, "catchup": 0, "steady": 0}))
        );
    }

    #[test]
    fn start_commit_requires_steady() {
        let status = MigrateStatus::new();
        assert!(!status.start_commit(Duration::from_millis(10)));
    }

    #[test]
    fn start_commit_waits_for_done() {
        let status = Arc::new(MigrateStatus::new());
        status
            .prepare(ns(), "d:1".into(), doc(json!({"k": 0})), doc(json!({"k": 9})))
            .unwrap();
        status.set_state(MigrateState::Steady);

        let worker = {
            let status = Arc::clone(&status);
            std::thread::spawn(move || {
                // Emulate the worker noticing COMMIT_START and finishing.
                loop {
                    let inner = status.inner.lock().expect("poisoned");
                    if inner.state == MigrateState::CommitStart {
                        drop(inner);
                        status.set_state(MigrateState::Done);
                        return;
                    }
                    let _ = status
                        .changed
                        .wait_timeout(inner, Duration::from_millis(5))
                        .expect("poisoned");
                }
            })
        };

        assert!(status.start_commit(Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn apply_upserts_and_deletes_idempotently() {
        let store = LocalStore::new();
        let ns = ns();
        store.upsert_raw(&ns, doc(json!({"_id": 1, "k": 1, "v": "old"})));
        store.upsert_raw(&ns, doc(json!({"_id": 2, "k": 2})));

        let batch = TransferBatch {
            deleted: vec![DocId::new(json!(2)), DocId::new(json!(42))],
            reload: vec![doc(json!({"_id": 1, "k": 1, "v": "new"}))],
            size: 64,
        };

        apply(&store, &ns, &batch);
        let after_once: Vec<Doc> = store.with_collection_read(&ns, |c| c.values().cloned().collect());
        apply(&store, &ns, &batch);
        let after_twice: Vec<Doc> =
            store.with_collection_read(&ns, |c| c.values().cloned().collect());

        assert_eq!(after_once, after_twice);
        assert_eq!(store.count(&ns), 1);
        assert_eq!(
            store.find_by_id(&ns, &DocId::new(json!(1))).unwrap().get("v"),
            Some(&json!("new"))
        );
    }

    #[test]
    fn apply_tolerates_out_of_range_reloads() {
        // Range checking happened at capture time; apply takes what it gets.
        let store = LocalStore::new();
        let ns = ns();
        let batch = TransferBatch {
            deleted: vec![],
            reload: vec![doc(json!({"_id": 9, "k": 100000}))],
            size: 16,
        };
        apply(&store, &ns, &batch);
        assert_eq!(store.count(&ns), 1);
    }
}
