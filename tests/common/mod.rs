//! Shared harness: in-process shard nodes over real TCP, one shared
//! in-memory config store, and a scriptable stub peer.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::Value;

use loamd::commands::CommandRegistry;
use loamd::configstore::{ConfigStore, MemConfigStore};
use loamd::core::{ChunkId, ChunkRecord, ChunkVersion, Doc, Namespace, ShardId};
use loamd::rpc::{RpcServer, RpcServerConfig, RpcServerHandle, ShardClient};
use loamd::{ShardNode, Tunables};

/// Tunables scaled for tests: same semantics, faster polls.
pub fn fast_tunables() -> Tunables {
    Tunables {
        steady_poll_interval_ms: 50,
        recipient_steady_sleep_ms: 5,
        commit_wait_ms: 20_000,
        ..Tunables::default()
    }
}

pub fn doc(v: Value) -> Doc {
    Doc::from_value(v).expect("object")
}

pub fn ns(raw: &str) -> Namespace {
    Namespace::parse(raw).expect("namespace")
}

pub struct TestShard {
    pub node: Arc<ShardNode>,
    pub handle: RpcServerHandle,
    pub addr: String,
}

impl TestShard {
    pub fn shard_id(&self) -> ShardId {
        ShardId::new(self.addr.clone()).expect("shard id")
    }

    /// Client with a timeout generous enough for a whole migration.
    pub fn client(&self) -> ShardClient {
        ShardClient::with_timeout(self.addr.clone(), Duration::from_secs(60))
    }
}

pub fn spawn_shard(config: &Arc<MemConfigStore>, tunables: Tunables) -> TestShard {
    loamd::telemetry::init_for_tests();
    let addr = reserve_addr();
    let node = ShardNode::new(
        ShardId::new(addr.clone()).expect("shard id"),
        Arc::clone(config) as Arc<dyn ConfigStore>,
        tunables,
    );
    let server = RpcServer::new(
        Arc::clone(&node),
        CommandRegistry::standard(),
        RpcServerConfig::new(addr.clone()),
    );
    let handle = server.start().expect("rpc server start");
    TestShard { node, handle, addr }
}

fn reserve_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr.to_string()
}

pub fn seed_chunk(
    config: &MemConfigStore,
    id: &str,
    ns_raw: &str,
    min: Value,
    max: Value,
    shard: &str,
    version: u64,
) -> ChunkId {
    let id = ChunkId::new(id).expect("chunk id");
    config
        .insert_chunk(ChunkRecord {
            id: id.clone(),
            ns: ns(ns_raw),
            min: doc(min),
            max: doc(max),
            shard: ShardId::new(shard).expect("shard id"),
            lastmod: ChunkVersion::from_raw(version),
        })
        .expect("seed chunk");
    id
}

pub fn move_chunk_cmd(
    ns: &str,
    from: &str,
    to: &str,
    chunk_id: &str,
    min: Value,
    max: Value,
) -> Doc {
    doc(serde_json::json!({
        "moveChunk": ns,
        "to": to,
        "from": from,
        "min": min,
        "max": max,
        "shardId": chunk_id,
    }))
}

pub fn wait_until(what: &str, timeout: Duration, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// A fake peer answering shard RPCs from a script. Lets tests drive the
/// coordinator into exact remote responses that are hard to time against a
/// real recipient.
pub struct StubShard {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    pub addr: String,
}

impl StubShard {
    pub fn spawn(script: impl Fn(&str, &Doc) -> Doc + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub");
        listener.set_nonblocking(true).expect("nonblocking");
        let addr = listener.local_addr().expect("stub addr").to_string();
        let shutdown = Arc::new(AtomicBool::new(false));
        let script = Arc::new(script);

        let join = {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    match listener.accept() {
                        Ok((stream, _)) => {
                            let script = Arc::clone(&script);
                            thread::spawn(move || serve_stub_connection(stream, script));
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(10));
                        }
                        Err(_) => return,
                    }
                }
            })
        };

        Self {
            shutdown,
            join: Some(join),
            addr,
        }
    }
}

impl Drop for StubShard {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn serve_stub_connection(stream: TcpStream, script: Arc<dyn Fn(&str, &Doc) -> Doc + Send + Sync>) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let Ok(request) = serde_json::from_str::<Doc>(line.trim_end()) else {
            return;
        };
        let Some((name, _)) = request.first() else {
            return;
        };
        let response = script(name.as_str(), &request);
        let Ok(mut payload) = serde_json::to_vec(&response) else {
            return;
        };
        payload.push(b'\n');
        if writer.write_all(&payload).is_err() {
            return;
        }
    }
}
