//! Core error taxonomy.

use thiserror::Error;

/// Whether retrying this operation may succeed.
///
/// The router uses this to decide between retrying a migration (lock
/// contention, stale ownership view) and giving up (malformed request,
/// critical-section damage).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Validation failures for domain atoms.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid namespace {raw:?}: {reason}")]
    InvalidNamespace { raw: String, reason: String },

    #[error("invalid shard id: {reason}")]
    InvalidShard { reason: String },

    #[error("invalid lock name: {reason}")]
    InvalidLockName { reason: String },

    #[error("invalid chunk id: {reason}")]
    InvalidChunkId { reason: String },

    #[error("expected a document, found {found}")]
    NotADocument { found: &'static str },

    #[error("range bounds must be non-empty documents")]
    EmptyRangeBound,
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }
}
