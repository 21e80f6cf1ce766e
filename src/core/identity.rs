//! Identity atoms.
//!
//! Namespace: fully qualified collection name ("db.collection")
//! ShardId: a data-bearing node, identified by its advertised address
//! ProcessId: stable within one process run, unique across the fleet
//! LockName / LockToken: distributed-lock identity and acquisition token

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::CoreError;

/// Fully qualified collection name, "db.collection".
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() {
            return Err(CoreError::InvalidNamespace {
                raw: s,
                reason: "empty".into(),
            });
        }
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self(s)),
            _ => Err(CoreError::InvalidNamespace {
                raw: s,
                reason: "expected db.collection".into(),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({:?})", self.0)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A data-bearing node. Shards name themselves by their advertised
/// host:port, which is also how peers dial them.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() {
            return Err(CoreError::InvalidShard {
                reason: "empty".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({:?})", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process identity: "<shard>:<random>". Stable for one process run; a
/// restarted process gets a fresh one, so its old lock pings go stale.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn generate(shard: &ShardId) -> Self {
        Self(format!("{}:{}", shard.as_str(), Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessId({:?})", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Free-form distributed-lock name. Migrations lock the namespace they move.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockName(String);

impl LockName {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() {
            return Err(CoreError::InvalidLockName {
                reason: "empty".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Namespace> for LockName {
    fn from(ns: &Namespace) -> Self {
        Self(ns.as_str().to_string())
    }
}

impl fmt::Debug for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockName({:?})", self.0)
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// High-entropy acquisition token. The tuple `(name, token)` uniquely
/// identifies one successful lock acquisition across all time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockToken({})", self.0.simple())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_requires_db_and_collection() {
        assert!(Namespace::parse("test.foo").is_ok());
        assert!(Namespace::parse("").is_err());
        assert!(Namespace::parse("nodot").is_err());
        assert!(Namespace::parse(".foo").is_err());
        assert!(Namespace::parse("db.").is_err());
    }

    #[test]
    fn process_ids_are_unique_per_run() {
        let shard = ShardId::new("127.0.0.1:27018").unwrap();
        let a = ProcessId::generate(&shard);
        let b = ProcessId::generate(&shard);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("127.0.0.1:27018:"));
    }

    #[test]
    fn lock_tokens_never_collide_in_practice() {
        assert_ne!(LockToken::generate(), LockToken::generate());
    }
}
