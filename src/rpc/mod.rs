//! Shard admin RPC surface.
//!
//! Protocol: newline-delimited JSON over TCP.
//!
//! Request format: one document per line whose first field names the
//! command, e.g. `{"_transferMods": 1}\n`.
//! Response format: one document per line carrying `"ok": 1` on success or
//! `"ok": 0, "errmsg": "..."` plus diagnostic fields on failure.

pub mod client;
pub mod server;

use std::io::{BufRead, Write};

use serde_json::json;
use thiserror::Error;

use crate::core::{Doc, Transience};

pub use client::ShardClient;
pub use server::{RpcServer, RpcServerConfig, RpcServerHandle};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("cannot resolve address {0:?}")]
    BadAddress(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("command failed: {errmsg}")]
    Command { errmsg: String },
}

impl RpcError {
    pub fn transience(&self) -> Transience {
        match self {
            RpcError::Io(_) | RpcError::ConnectionClosed => Transience::Retryable,
            RpcError::BadAddress(_) | RpcError::Codec(_) => Transience::Permanent,
            RpcError::Command { .. } => Transience::Unknown,
        }
    }
}

/// Whether a response document reports success.
pub fn response_ok(doc: &Doc) -> bool {
    match doc.get("ok") {
        Some(v) => v.as_f64().map(|n| n != 0.0).or(v.as_bool()).unwrap_or(false),
        None => false,
    }
}

/// The `errmsg` of a failed response, if any.
pub fn response_errmsg(doc: &Doc) -> String {
    doc.get("errmsg")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error")
        .to_string()
}

pub fn ok_response() -> Doc {
    let mut doc = Doc::new();
    doc.insert("ok", json!(1));
    doc
}

pub fn error_response(errmsg: impl Into<String>) -> Doc {
    let mut doc = Doc::new();
    doc.insert("errmsg", json!(errmsg.into()));
    doc.insert("ok", json!(0));
    doc
}

pub(crate) fn write_doc(writer: &mut impl Write, doc: &Doc) -> Result<(), RpcError> {
    let mut line = serde_json::to_vec(doc)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

pub(crate) fn read_doc(reader: &mut impl BufRead) -> Result<Option<Doc>, RpcError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    let doc = serde_json::from_str(line.trim_end())?;
    Ok(Some(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn doc_round_trips_over_a_line() {
        let mut doc = Doc::new();
        doc.insert("ping", json!(1));

        let mut buf = Vec::new();
        write_doc(&mut buf, &doc).unwrap();
        assert!(buf.ends_with(b"\n"));

        let mut reader = Cursor::new(buf);
        let back = read_doc(&mut reader).unwrap().unwrap();
        assert_eq!(back, doc);
        assert!(read_doc(&mut reader).unwrap().is_none());
    }

    #[test]
    fn response_ok_accepts_numeric_and_bool() {
        assert!(response_ok(&ok_response()));
        assert!(!response_ok(&error_response("nope")));
        let mut doc = Doc::new();
        doc.insert("ok", json!(true));
        assert!(response_ok(&doc));
        assert!(!response_ok(&Doc::new()));
    }

    #[test]
    fn error_response_carries_errmsg() {
        let doc = error_response("someone else has the lock");
        assert_eq!(response_errmsg(&doc), "someone else has the lock");
        assert!(!response_ok(&doc));
    }
}
