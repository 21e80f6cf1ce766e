//! Local collection store.
//!
//! The storage engine proper is outside this crate; this is the minimal
//! surface the migration core needs from it: upsert, delete-by-id, point
//! lookup, shard-key range scan/delete, an index catalog, and per-collection
//! reader/writer locks. Every data-path write notifies the registered op
//! observer on the committing thread, which is how the donor's capture hook
//! sees live traffic.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::core::{Doc, DocId, KeyRange, Namespace};

/// Write operation kinds as seen by the op observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    /// No-op marker entries; never captured.
    Noop,
    /// Administrative commands; never captured.
    Command,
}

/// Storage write hook: `(store, kind, ns, doc, match_predicate)`.
///
/// Invoked after the write commits, on the same thread, outside the
/// collection lock (observers may re-read through the store).
pub type OpObserver = dyn Fn(&LocalStore, OpKind, &Namespace, &Doc, Option<&Doc>) + Send + Sync;

#[derive(Default)]
struct Collection {
    docs: RwLock<BTreeMap<DocId, Doc>>,
    indexes: RwLock<Vec<Doc>>,
}

#[derive(Default)]
pub struct LocalStore {
    collections: Mutex<BTreeMap<Namespace, Arc<Collection>>>,
    observer: RwLock<Option<Arc<OpObserver>>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_observer(&self, observer: Arc<OpObserver>) {
        *self.observer.write().expect("observer lock poisoned") = Some(observer);
    }

    fn collection(&self, ns: &Namespace) -> Arc<Collection> {
        let mut map = self.collections.lock().expect("collection map poisoned");
        Arc::clone(map.entry(ns.clone()).or_default())
    }

    fn notify(&self, kind: OpKind, ns: &Namespace, doc: &Doc, predicate: Option<&Doc>) {
        let observer = self
            .observer
            .read()
            .expect("observer lock poisoned")
            .clone();
        if let Some(observer) = observer {
            observer(self, kind, ns, doc, predicate);
        }
    }

    // --- data path (observed) ---

    /// Insert or replace by `_id`. Documents without `_id` are rejected by
    /// the caller's validation; here they are silently skipped.
    pub fn insert(&self, ns: &Namespace, doc: Doc) {
        let Some(id) = doc.id() else {
            tracing::warn!(ns = %ns, "insert without _id dropped");
            return;
        };
        let coll = self.collection(ns);
        {
            let mut docs = coll.docs.write().expect("collection lock poisoned");
            docs.insert(id, doc.clone());
        }
        self.notify(OpKind::Insert, ns, &doc, None);
    }

    /// Replace the document matched by `predicate` (an `_id` match).
    pub fn update(&self, ns: &Namespace, predicate: &Doc, doc: Doc) {
        let id = predicate.id().or_else(|| doc.id());
        let Some(id) = id else {
            tracing::warn!(ns = %ns, "update without _id dropped");
            return;
        };
        let coll = self.collection(ns);
        {
            let mut docs = coll.docs.write().expect("collection lock poisoned");
            docs.insert(id, doc.clone());
        }
        self.notify(OpKind::Update, ns, &doc, Some(predicate));
    }

    /// Delete by `_id` match. Returns whether a document was removed.
    pub fn remove(&self, ns: &Namespace, predicate: &Doc) -> bool {
        let Some(id) = predicate.id() else {
            tracing::warn!(ns = %ns, "remove without _id dropped");
            return false;
        };
        let coll = self.collection(ns);
        let removed = {
            let mut docs = coll.docs.write().expect("collection lock poisoned");
            docs.remove(&id).is_some()
        };
        if removed {
            self.notify(OpKind::Delete, ns, predicate, None);
        }
        removed
    }

    // --- unobserved primitives (migration apply path, queries) ---

    /// Upsert without notifying the observer. The recipient's apply path
    /// uses this: replicated migration traffic is not local write traffic.
    pub fn upsert_raw(&self, ns: &Namespace, doc: Doc) {
        let Some(id) = doc.id() else {
            tracing::warn!(ns = %ns, "upsert without _id dropped");
            return;
        };
        let coll = self.collection(ns);
        let mut docs = coll.docs.write().expect("collection lock poisoned");
        docs.insert(id, doc);
    }

    /// Delete by id without notifying the observer. Absent ids are a no-op.
    pub fn delete_raw(&self, ns: &Namespace, id: &DocId) -> bool {
        let coll = self.collection(ns);
        let mut docs = coll.docs.write().expect("collection lock poisoned");
        docs.remove(id).is_some()
    }

    pub fn find_by_id(&self, ns: &Namespace, id: &DocId) -> Option<Doc> {
        let coll = self.collection(ns);
        let docs = coll.docs.read().expect("collection lock poisoned");
        docs.get(id).cloned()
    }

    /// All documents whose shard-key projection lies in `range`.
    pub fn range_scan(&self, ns: &Namespace, range: &KeyRange) -> Vec<Doc> {
        let coll = self.collection(ns);
        let docs = coll.docs.read().expect("collection lock poisoned");
        docs.values().filter(|d| range.contains(d)).cloned().collect()
    }

    pub fn count_range(&self, ns: &Namespace, range: &KeyRange) -> u64 {
        let coll = self.collection(ns);
        let docs = coll.docs.read().expect("collection lock poisoned");
        docs.values().filter(|d| range.contains(d)).count() as u64
    }

    /// Delete every document in `range`. Returns the number removed.
    pub fn remove_range(&self, ns: &Namespace, range: &KeyRange) -> u64 {
        let coll = self.collection(ns);
        let mut docs = coll.docs.write().expect("collection lock poisoned");
        let doomed: Vec<DocId> = docs
            .iter()
            .filter(|(_, d)| range.contains(d))
            .map(|(id, _)| id.clone())
            .collect();
        let count = doomed.len() as u64;
        for id in doomed {
            docs.remove(&id);
        }
        count
    }

    pub fn count(&self, ns: &Namespace) -> u64 {
        let coll = self.collection(ns);
        let docs = coll.docs.read().expect("collection lock poisoned");
        docs.len() as u64
    }

    // --- consistent multi-read sections ---

    /// Run `f` under the collection's read lock. The donor's transfer path
    /// uses this to re-read documents against one point-in-time view.
    pub fn with_collection_read<R>(
        &self,
        ns: &Namespace,
        f: impl FnOnce(&BTreeMap<DocId, Doc>) -> R,
    ) -> R {
        let coll = self.collection(ns);
        let docs = coll.docs.read().expect("collection lock poisoned");
        f(&docs)
    }

    /// Run `f` under the collection's write lock. The recipient applies one
    /// batch per acquisition.
    pub fn with_collection_write<R>(
        &self,
        ns: &Namespace,
        f: impl FnOnce(&mut BTreeMap<DocId, Doc>) -> R,
    ) -> R {
        let coll = self.collection(ns);
        let mut docs = coll.docs.write().expect("collection lock poisoned");
        f(&mut docs)
    }

    // --- index catalog ---

    pub fn indexes(&self, ns: &Namespace) -> Vec<Doc> {
        let coll = self.collection(ns);
        let indexes = coll.indexes.read().expect("index catalog poisoned");
        indexes.clone()
    }

    pub fn add_index(&self, ns: &Namespace, spec: Doc) {
        let coll = self.collection(ns);
        let mut indexes = coll.indexes.write().expect("index catalog poisoned");
        if !indexes.contains(&spec) {
            indexes.push(spec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ns() -> Namespace {
        Namespace::parse("test.foo").unwrap()
    }

    fn doc(v: serde_json::Value) -> Doc {
        Doc::from_value(v).unwrap()
    }

    #[test]
    fn insert_find_remove_round_trip() {
        let store = LocalStore::new();
        let ns = ns();
        store.insert(&ns, doc(json!({"_id": 1, "k": 5})));
        let id = DocId::new(json!(1));
        assert_eq!(store.find_by_id(&ns, &id), Some(doc(json!({"_id": 1, "k": 5}))));
        assert!(store.remove(&ns, &doc(json!({"_id": 1}))));
        assert_eq!(store.find_by_id(&ns, &id), None);
    }

    #[test]
    fn range_scan_and_remove_honor_bounds() {
        let store = LocalStore::new();
        let ns = ns();
        for k in 0..10 {
            store.insert(&ns, doc(json!({"_id": k, "k": k})));
        }
        let range = KeyRange::new(doc(json!({"k": 3})), doc(json!({"k": 7}))).unwrap();
        assert_eq!(store.range_scan(&ns, &range).len(), 4);
        assert_eq!(store.remove_range(&ns, &range), 4);
        assert_eq!(store.count(&ns), 6);
        assert_eq!(store.count_range(&ns, &range), 0);
    }

    #[test]
    fn observer_sees_data_path_but_not_raw_writes() {
        let store = LocalStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            store.set_observer(Arc::new(move |_, _, _, _, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let ns = ns();
        store.insert(&ns, doc(json!({"_id": 1})));
        store.update(&ns, &doc(json!({"_id": 1})), doc(json!({"_id": 1, "x": 2})));
        store.remove(&ns, &doc(json!({"_id": 1})));
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        store.upsert_raw(&ns, doc(json!({"_id": 2})));
        store.delete_raw(&ns, &DocId::new(json!(2)));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn index_catalog_deduplicates_specs() {
        let store = LocalStore::new();
        let ns = ns();
        let spec = doc(json!({"name": "k_1", "key": {"k": 1}}));
        store.add_index(&ns, spec.clone());
        store.add_index(&ns, spec);
        assert_eq!(store.indexes(&ns).len(), 1);
    }
}
