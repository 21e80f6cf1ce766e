//! Core domain types.
//!
//! Module hierarchy follows type dependency order:
//! - time: wall-clock primitives
//! - error: validation errors and retryability
//! - identity: Namespace, ShardId, ProcessId, lock identity
//! - doc: documents, ids, shard-key math
//! - chunk: chunk ownership records and versions

pub mod chunk;
pub mod doc;
pub mod error;
pub mod identity;
pub mod time;

pub use chunk::{ChunkId, ChunkRecord, ChunkVersion};
pub use doc::{cmp_projection, cmp_values, Doc, DocId, KeyRange};
pub use error::{CoreError, Transience};
pub use identity::{LockName, LockToken, Namespace, ProcessId, ShardId};
pub use time::WallTime;
