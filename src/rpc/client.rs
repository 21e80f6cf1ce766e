//! Outbound command client.
//!
//! One connection per command, like the scoped connections the migration
//! protocol was designed around: every step is a fresh request/response, so
//! a donor or recipient that dies between steps fails the next call instead
//! of wedging a stream.

use std::io::BufReader;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde_json::json;

use crate::core::{Doc, KeyRange, Namespace};
use crate::migrate::TransferBatch;

use super::{read_doc, response_errmsg, response_ok, write_doc, RpcError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ShardClient {
    addr: String,
    timeout: Duration,
}

impl ShardClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_timeout(addr, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one command document and read its response.
    pub fn run_command(&self, cmd: &Doc) -> Result<Doc, RpcError> {
        let addr = self
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RpcError::BadAddress(self.addr.clone()))?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut writer = stream.try_clone()?;
        write_doc(&mut writer, cmd)?;

        let mut reader = BufReader::new(stream);
        read_doc(&mut reader)?.ok_or(RpcError::ConnectionClosed)
    }

    /// Run a command and fail unless the response reports success.
    pub fn run_checked(&self, cmd: &Doc) -> Result<Doc, RpcError> {
        let response = self.run_command(cmd)?;
        if response_ok(&response) {
            Ok(response)
        } else {
            Err(RpcError::Command {
                errmsg: response_errmsg(&response),
            })
        }
    }

    /// Trivial liveness probe.
    pub fn ping(&self) -> Result<(), RpcError> {
        let mut cmd = Doc::new();
        cmd.insert("ping", json!(1));
        self.run_checked(&cmd).map(|_| ())
    }

    /// The donor's normal query path: all documents of `ns` whose shard key
    /// lies in `range`.
    pub fn range_query(&self, ns: &Namespace, range: &KeyRange) -> Result<Vec<Doc>, RpcError> {
        let mut cmd = Doc::new();
        cmd.insert("query", json!(ns.as_str()));
        cmd.insert("min", range.min.clone().into_value());
        cmd.insert("max", range.max.clone().into_value());
        let response = self.run_checked(&cmd)?;
        docs_field(&response, "docs")
    }

    /// The donor's index catalog for `ns`.
    pub fn list_indexes(&self, ns: &Namespace) -> Result<Vec<Doc>, RpcError> {
        let mut cmd = Doc::new();
        cmd.insert("listIndexes", json!(ns.as_str()));
        let response = self.run_checked(&cmd)?;
        docs_field(&response, "indexes")
    }

    /// Drain one change batch from the donor.
    pub fn transfer_mods(&self) -> Result<TransferBatch, RpcError> {
        let mut cmd = Doc::new();
        cmd.insert("_transferMods", json!(1));
        let response = self.run_checked(&cmd)?;
        Ok(serde_json::from_value(response.into_value())?)
    }

    pub fn recv_chunk_start(
        &self,
        ns: &Namespace,
        from: &str,
        range: &KeyRange,
    ) -> Result<Doc, RpcError> {
        let mut cmd = Doc::new();
        cmd.insert("_recvChunkStart", json!(ns.as_str()));
        cmd.insert("from", json!(from));
        cmd.insert("min", range.min.clone().into_value());
        cmd.insert("max", range.max.clone().into_value());
        self.run_command(&cmd)
    }

    pub fn recv_chunk_status(&self) -> Result<Doc, RpcError> {
        let mut cmd = Doc::new();
        cmd.insert("_recvChunkStatus", json!(1));
        self.run_command(&cmd)
    }

    pub fn recv_chunk_commit(&self) -> Result<Doc, RpcError> {
        let mut cmd = Doc::new();
        cmd.insert("_recvChunkCommit", json!(1));
        self.run_command(&cmd)
    }
}

fn docs_field(response: &Doc, key: &str) -> Result<Vec<Doc>, RpcError> {
    let Some(value) = response.get(key) else {
        return Ok(Vec::new());
    };
    Ok(serde_json::from_value(value.clone())?)
}
