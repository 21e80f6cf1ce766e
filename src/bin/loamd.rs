//! Shard daemon entry point.
//!
//! Runs the RPC endpoint until stdin closes (the supervisor convention:
//! the parent holds the pipe open for the daemon's lifetime), then shuts
//! down cleanly.

use std::io::Read;
use std::sync::Arc;

use clap::Parser;

use loamd::commands::CommandRegistry;
use loamd::configstore::MemConfigStore;
use loamd::core::ShardId;
use loamd::rpc::{RpcServer, RpcServerConfig};
use loamd::{ShardNode, Tunables};

#[derive(Debug, Parser)]
#[command(name = "loamd", about = "Loam data-bearing shard daemon")]
struct NodeArgs {
    /// Address this shard advertises to peers and the config store.
    #[arg(long)]
    shard: String,

    /// Listen address for the shard RPC endpoint. Defaults to the
    /// advertised address.
    #[arg(long)]
    listen: Option<String>,

    /// Tracing filter, e.g. "info" or "loamd=debug".
    #[arg(long)]
    log_filter: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = NodeArgs::parse();
    loamd::telemetry::init(args.log_filter.as_deref(), args.log_json);

    let shard = ShardId::new(args.shard.clone())?;
    let listen = args.listen.unwrap_or(args.shard);

    // An in-process config store; pointing the daemon at a replicated
    // config cluster is deployment wiring outside this crate.
    let config_store = Arc::new(MemConfigStore::new());
    let node = ShardNode::new(shard, config_store, Tunables::default());

    let server = RpcServer::new(
        Arc::clone(&node),
        CommandRegistry::standard(),
        RpcServerConfig::new(listen),
    );
    let handle = server.start()?;
    tracing::info!(shard = %node.shard(), addr = %handle.local_addr(), "loamd up");

    wait_for_stdin_close();

    tracing::info!("shutting down");
    handle.shutdown();
    node.shutdown();
    Ok(())
}

fn wait_for_stdin_close() {
    let mut sink = [0u8; 64];
    let mut stdin = std::io::stdin();
    loop {
        match stdin.read(&mut sink) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
