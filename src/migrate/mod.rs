//! Chunk migration: donor capture, recipient state machine, coordinator.

pub mod coordinator;
pub mod donor;
pub mod recipient;

pub use coordinator::move_chunk;
pub use donor::{CaptureError, CaptureGuard, MigrateFromStatus, TransferBatch};
pub use recipient::{apply, MigrateState, MigrateStatus, RecipientError};
