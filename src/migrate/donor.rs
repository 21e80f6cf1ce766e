//! Donor-side write capture.
//!
//! While a chunk is being migrated away, every write the donor commits in
//! the moving range is recorded here: ids of deleted documents and ids of
//! inserted/updated ones. The recipient drains both queues through
//! `_transferMods`; reloaded documents are shipped by current value, which
//! coalesces any number of updates to the same key into one shipment.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Doc, DocId, KeyRange, Namespace};
use crate::storage::{LocalStore, OpKind};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("migration already in progress")]
    AlreadyActive,

    #[error("no active migration!")]
    NotActive,

    #[error(transparent)]
    Core(#[from] crate::core::CoreError),
}

/// One `_transferMods` change batch. Field names are wire-stable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferBatch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<DocId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reload: Vec<Doc>,
    pub size: u64,
}

impl TransferBatch {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

struct CaptureInner {
    ns: Namespace,
    range: KeyRange,
    deleted: VecDeque<DocId>,
    reload: VecDeque<DocId>,
}

/// Process-wide donor migration state. One instance per shard daemon; at
/// most one migration captures at a time.
#[derive(Default)]
pub struct MigrateFromStatus {
    active: AtomicBool,
    in_critical_section: AtomicBool,
    inner: Mutex<Option<CaptureInner>>,
}

impl MigrateFromStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn in_critical_section(&self) -> bool {
        self.in_critical_section.load(Ordering::SeqCst)
    }

    pub fn set_in_critical_section(&self, raised: bool) {
        self.in_critical_section.store(raised, Ordering::SeqCst);
    }

    /// Begin capturing writes to `[min, max)` of `ns`.
    pub fn start(&self, ns: Namespace, min: Doc, max: Doc) -> Result<(), CaptureError> {
        let range = KeyRange::new(min, max)?;
        let mut inner = self.inner.lock().expect("capture state poisoned");
        if self.active.load(Ordering::SeqCst) {
            return Err(CaptureError::AlreadyActive);
        }
        *inner = Some(CaptureInner {
            ns,
            range,
            deleted: VecDeque::new(),
            reload: VecDeque::new(),
        });
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Idempotent teardown: drops the buffers and both flags.
    pub fn done(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.in_critical_section.store(false, Ordering::SeqCst);
        let mut inner = self.inner.lock().expect("capture state poisoned");
        *inner = None;
    }

    /// Storage write hook. Called on the committing thread for every write.
    pub fn log_op(
        &self,
        store: &LocalStore,
        kind: OpKind,
        ns: &Namespace,
        doc: &Doc,
        predicate: Option<&Doc>,
    ) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        if matches!(kind, OpKind::Noop | OpKind::Command) {
            return;
        }

        let id = predicate.and_then(|p| p.id()).or_else(|| doc.id());
        let Some(id) = id else {
            tracing::warn!(ns = %ns, doc = ?doc, "write capture got op with no _id, ignoring");
            return;
        };

        // Deletes cannot be range-filtered: the document is gone, so its
        // shard key is unknowable. Ship the id; the recipient tolerates
        // deletes for ids it never had.
        let candidate = {
            let mut guard = self.inner.lock().expect("capture state poisoned");
            let Some(inner) = guard.as_mut() else {
                return;
            };
            if inner.ns != *ns {
                return;
            }
            match kind {
                OpKind::Delete => {
                    inner.deleted.push_back(id);
                    return;
                }
                OpKind::Insert => Some(doc.clone()),
                OpKind::Update => None,
                OpKind::Noop | OpKind::Command => return,
            }
        };

        // Updates may be partial on the wire; re-read the live document to
        // range-check the result. Done outside the capture mutex so the
        // lock order (collection, then capture) matches the transfer path.
        let candidate = match candidate {
            Some(doc) => doc,
            None => match store.find_by_id(ns, &id) {
                Some(doc) => doc,
                None => {
                    tracing::warn!(
                        ns = %ns,
                        id = %id,
                        "write capture couldn't find updated doc, concurrent delete"
                    );
                    return;
                }
            },
        };

        let mut guard = self.inner.lock().expect("capture state poisoned");
        let Some(inner) = guard.as_mut() else {
            return;
        };
        if inner.ns != *ns {
            return;
        }
        if inner.range.contains(&candidate) {
            inner.reload.push_back(id);
        }
    }

    /// Drain up to `batch_budget` bytes of pending changes. Emitted entries
    /// leave the queues: once handed over, the donor forgets them.
    pub fn transfer_mods(
        &self,
        store: &LocalStore,
        batch_budget: u64,
    ) -> Result<TransferBatch, CaptureError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(CaptureError::NotActive);
        }

        let ns = {
            let guard = self.inner.lock().expect("capture state poisoned");
            match guard.as_ref() {
                Some(inner) => inner.ns.clone(),
                None => return Err(CaptureError::NotActive),
            }
        };

        // Hold the collection read lock across the re-reads so the reloaded
        // documents come from one point-in-time view.
        let batch = store.with_collection_read(&ns, |docs| {
            let mut guard = self.inner.lock().expect("capture state poisoned");
            let Some(inner) = guard.as_mut() else {
                return TransferBatch::default();
            };

            let mut batch = TransferBatch::default();

            while batch.size < batch_budget {
                let Some(id) = inner.deleted.pop_front() else {
                    break;
                };
                batch.size += id.approx_size();
                batch.deleted.push(id);
            }

            while batch.size < batch_budget {
                let Some(id) = inner.reload.pop_front() else {
                    break;
                };
                batch.size += id.approx_size();
                if let Some(doc) = docs.get(&id) {
                    batch.size += doc.approx_size();
                    batch.reload.push(doc.clone());
                }
                // A missing doc was deleted after capture; its delete is
                // already queued or shipped, so the id is simply dropped.
            }

            batch
        });

        Ok(batch)
    }
}

/// Scoped capture: starts on construction, tears down on drop, so every
/// exit path of the coordinator releases the donor state.
pub struct CaptureGuard<'a> {
    status: &'a MigrateFromStatus,
}

impl<'a> CaptureGuard<'a> {
    pub fn new(
        status: &'a MigrateFromStatus,
        ns: Namespace,
        min: Doc,
        max: Doc,
    ) -> Result<Self, CaptureError> {
        status.start(ns, min, max)?;
        Ok(Self { status })
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        self.status.done();
    }
}
