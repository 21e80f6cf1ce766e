//! Chunk ownership metadata.
//!
//! A chunk is a contiguous shard-key range of one namespace. Its config
//! record carries the owning shard and a version that is strictly increasing
//! per namespace; routers detect ownership changes by watching the highest
//! version they have seen.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::doc::Doc;
use super::error::CoreError;
use super::identity::{Namespace, ShardId};

/// Opaque chunk identity in the config store.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() {
            return Err(CoreError::InvalidChunkId {
                reason: "empty".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({:?})", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic chunk version, totally ordered per namespace.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChunkVersion(u64);

impl ChunkVersion {
    pub const ZERO: ChunkVersion = ChunkVersion(0);

    pub fn from_raw(v: u64) -> Self {
        Self(v)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn next(self) -> ChunkVersion {
        ChunkVersion(self.0 + 1)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One chunk ownership record in the config store's `chunks` collection.
/// Field names are wire-stable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    #[serde(rename = "_id")]
    pub id: ChunkId,
    pub ns: Namespace,
    pub min: Doc,
    pub max: Doc,
    pub shard: ShardId,
    pub lastmod: ChunkVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_next_is_strictly_increasing() {
        let v = ChunkVersion::ZERO;
        assert!(v.next() > v);
        assert_eq!(v.next().as_raw(), 1);
    }

    #[test]
    fn record_round_trips_with_wire_names() {
        let rec = ChunkRecord {
            id: ChunkId::new("test.foo-k_0").unwrap(),
            ns: Namespace::parse("test.foo").unwrap(),
            min: Doc::from_value(serde_json::json!({"k": 0})).unwrap(),
            max: Doc::from_value(serde_json::json!({"k": 100})).unwrap(),
            shard: ShardId::new("127.0.0.1:27018").unwrap(),
            lastmod: ChunkVersion::from_raw(3),
        };
        let value = serde_json::to_value(&rec).unwrap();
        assert_eq!(value["_id"], "test.foo-k_0");
        assert_eq!(value["lastmod"], 3);
        let back: ChunkRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, rec);
    }
}
