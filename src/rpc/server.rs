//! Shard RPC server: accept loop and per-connection handling.
//!
//! Connections are cheap and short-lived (peers connect per command), so
//! each one gets its own thread, bounded by a connection cap. The accept
//! loop polls nonblocking so shutdown is prompt.

use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::commands::CommandRegistry;
use crate::node::ShardNode;

use super::{error_response, read_doc, write_doc, RpcError};

const ACCEPT_POLL: Duration = Duration::from_millis(25);
const DEFAULT_MAX_CONNECTIONS: usize = 128;

#[derive(Clone, Debug)]
pub struct RpcServerConfig {
    pub listen_addr: String,
    pub max_connections: usize,
}

impl RpcServerConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

pub struct RpcServer {
    node: Arc<ShardNode>,
    registry: Arc<CommandRegistry>,
    config: RpcServerConfig,
}

pub struct RpcServerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl RpcServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RpcServer {
    pub fn new(node: Arc<ShardNode>, registry: CommandRegistry, config: RpcServerConfig) -> Self {
        Self {
            node,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn start(self) -> Result<RpcServerHandle, RpcError> {
        let listener = TcpListener::bind(&self.config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let runtime = ServerRuntime {
            node: self.node,
            registry: self.registry,
            shutdown: Arc::clone(&shutdown),
            active_connections: Arc::new(AtomicUsize::new(0)),
            max_connections: self.config.max_connections.max(1),
        };

        tracing::info!(addr = %local_addr, "shard rpc endpoint listening");
        let join = thread::spawn(move || run_accept_loop(listener, runtime));

        Ok(RpcServerHandle {
            shutdown,
            join: Some(join),
            local_addr,
        })
    }
}

#[derive(Clone)]
struct ServerRuntime {
    node: Arc<ShardNode>,
    registry: Arc<CommandRegistry>,
    shutdown: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
    max_connections: usize,
}

struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn try_acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Self {
                        active: Arc::clone(active),
                    });
                }
                Err(next) => current = next,
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

fn run_accept_loop(listener: TcpListener, runtime: ServerRuntime) {
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!("rpc server failed to set nonblocking: {err}");
        return;
    }

    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                let Some(guard) = ConnectionGuard::try_acquire(
                    &runtime.active_connections,
                    runtime.max_connections,
                ) else {
                    tracing::warn!(%peer, "rpc connection limit reached, refusing");
                    send_refusal(stream);
                    continue;
                };
                let runtime = runtime.clone();
                thread::spawn(move || {
                    if let Err(err) = run_connection(stream, runtime, guard) {
                        tracing::debug!(%peer, "rpc connection ended: {err}");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::warn!("rpc accept error: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn send_refusal(stream: TcpStream) {
    let mut stream = stream;
    let _ = write_doc(&mut stream, &error_response("connection limit reached"));
}

fn run_connection(
    stream: TcpStream,
    runtime: ServerRuntime,
    _guard: ConnectionGuard,
) -> Result<(), RpcError> {
    stream.set_nodelay(true)?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        let request = match read_doc(&mut reader) {
            Ok(Some(doc)) => doc,
            Ok(None) => return Ok(()),
            Err(RpcError::Codec(err)) => {
                // A malformed line gets a structured error, not a hangup.
                write_doc(&mut writer, &error_response(format!("bad request: {err}")))?;
                continue;
            }
            Err(err) => return Err(err),
        };

        // The internal port is the admin channel.
        let response = runtime.registry.dispatch(&runtime.node, &request, true);
        write_doc(&mut writer, &response)?;
    }
}
