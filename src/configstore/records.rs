//! Wire-stable record schemas for the config cluster's collections.

use serde::{Deserialize, Serialize};

use crate::core::{Doc, LockName, LockToken, Namespace, ProcessId, WallTime};

/// Lock record lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LockState {
    Free,
    Contested,
    Held,
}

impl From<LockState> for u8 {
    fn from(state: LockState) -> u8 {
        match state {
            LockState::Free => 0,
            LockState::Contested => 1,
            LockState::Held => 2,
        }
    }
}

impl TryFrom<u8> for LockState {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(LockState::Free),
            1 => Ok(LockState::Contested),
            2 => Ok(LockState::Held),
            other => Err(format!("invalid lock state {other}")),
        }
    }
}

/// One record in the `locks` collection. At most one record with
/// `state = Held` exists per name; `(name, ts)` identifies one successful
/// acquisition across all time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    #[serde(rename = "_id")]
    pub name: LockName,
    pub state: LockState,
    pub ts: LockToken,
    pub process: ProcessId,
    /// Acquisition wall-clock time as read from the config store.
    pub when: WallTime,
    /// Diagnostic holder string.
    pub who: String,
    /// Diagnostic reason.
    pub why: String,
}

/// One record in the `lockpings` collection: the last liveness write of a
/// process. Overwritten in place, never garbage collected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PingRecord {
    #[serde(rename = "_id")]
    pub process: ProcessId,
    pub ping: WallTime,
}

/// One audit entry in the config change log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub what: String,
    pub ns: Namespace,
    pub details: Doc,
    pub time: WallTime,
}
