//! Chunk migration core of the Loam sharded document store.
//!
//! This crate is the data-bearing node's side of online chunk movement:
//! the distributed lock that serializes migrations per collection, the
//! donor's live write capture, the recipient's clone/catchup/steady state
//! machine, and the coordinator that flips ownership metadata under a short
//! critical section.
//!
//! Subsystem map:
//! - [`core`]: documents, shard-key math, chunk records, identity
//! - [`configstore`]: client interface to the replicated config cluster
//! - [`distlock`]: lease-based distributed mutex with background pinger
//! - [`storage`]: local collection store with the capture write hook
//! - [`migrate`]: donor capture, recipient state machine, coordinator
//! - [`commands`]: command registry and handlers
//! - [`rpc`]: ndjson-over-TCP command endpoint and client
//! - [`node`]: one shard daemon's wiring

pub mod commands;
pub mod config;
pub mod configstore;
pub mod core;
pub mod distlock;
pub mod migrate;
pub mod node;
pub mod rpc;
pub mod storage;
pub mod telemetry;

pub use config::Tunables;
pub use node::ShardNode;
