//! Command registry and handlers.
//!
//! Commands are named capabilities in a registry, not a type hierarchy:
//! each entry records whether the command is admin-only, which node-wide
//! lock the dispatcher takes around it, and the handler itself. Handlers
//! close over the node they were registered for; there are no globals.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::thread;

use serde_json::json;

use crate::core::{Doc, KeyRange, Namespace};
use crate::migrate;
use crate::node::ShardNode;
use crate::rpc::{error_response, ok_response};

/// Node-wide lock the dispatcher holds while a handler runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    None,
    Read,
    Write,
}

type Handler = Box<dyn Fn(&Arc<ShardNode>, &Doc) -> Doc + Send + Sync>;

pub struct CommandSpec {
    pub requires_admin: bool,
    pub lock_kind: LockKind,
    handler: Handler,
}

pub struct CommandRegistry {
    commands: BTreeMap<&'static str, CommandSpec>,
    dispatch_lock: RwLock<()>,
}

impl CommandRegistry {
    pub fn empty() -> Self {
        Self {
            commands: BTreeMap::new(),
            dispatch_lock: RwLock::new(()),
        }
    }

    pub fn register(
        &mut self,
        name: &'static str,
        requires_admin: bool,
        lock_kind: LockKind,
        handler: impl Fn(&Arc<ShardNode>, &Doc) -> Doc + Send + Sync + 'static,
    ) {
        self.commands.insert(
            name,
            CommandSpec {
                requires_admin,
                lock_kind,
                handler: Box::new(handler),
            },
        );
    }

    pub fn spec(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    /// The full command surface of a shard daemon.
    pub fn standard() -> Self {
        let mut registry = Self::empty();

        registry.register("ping", false, LockKind::None, |_, _| ok_response());

        registry.register("query", false, LockKind::Read, |node, cmd| {
            range_query(node, cmd)
        });

        registry.register("listIndexes", false, LockKind::Read, |node, cmd| {
            list_indexes(node, cmd)
        });

        registry.register("moveChunk", true, LockKind::None, |node, cmd| {
            migrate::move_chunk(node, cmd)
        });

        registry.register("_transferMods", true, LockKind::None, |node, _| {
            transfer_mods(node)
        });

        // The write lock here means no other locked command can observe the
        // recipient between its activation and the worker starting.
        registry.register("_recvChunkStart", true, LockKind::Write, |node, cmd| {
            recv_chunk_start(node, cmd)
        });

        registry.register("_recvChunkStatus", true, LockKind::None, |node, _| {
            let mut response = node.recipient().status();
            response.insert("ok", json!(1));
            response
        });

        registry.register("_recvChunkCommit", true, LockKind::None, |node, _| {
            recv_chunk_commit(node)
        });

        registry
    }

    /// Look up the command named by the request's first field and run it.
    pub fn dispatch(&self, node: &Arc<ShardNode>, request: &Doc, admin: bool) -> Doc {
        let Some((name, _)) = request.first() else {
            return error_response("empty command document");
        };
        let Some(spec) = self.commands.get(name.as_str()) else {
            return error_response(format!("no such command: {name}"));
        };
        if spec.requires_admin && !admin {
            return error_response(format!("command {name} requires admin"));
        }

        match spec.lock_kind {
            LockKind::None => (spec.handler)(node, request),
            LockKind::Read => {
                let _guard = self.dispatch_lock.read().expect("dispatch lock poisoned");
                (spec.handler)(node, request)
            }
            LockKind::Write => {
                let _guard = self.dispatch_lock.write().expect("dispatch lock poisoned");
                (spec.handler)(node, request)
            }
        }
    }
}

fn parse_ns_and_range(cmd: &Doc) -> Result<(Namespace, KeyRange), Doc> {
    let ns = cmd
        .first()
        .and_then(|(_, v)| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| error_response("need to specify namespace"))?;
    let ns = Namespace::parse(ns).map_err(|err| error_response(err.to_string()))?;

    let min = cmd
        .get("min")
        .cloned()
        .and_then(|v| Doc::from_value(v).ok())
        .ok_or_else(|| error_response("need to specify a min"))?;
    let max = cmd
        .get("max")
        .cloned()
        .and_then(|v| Doc::from_value(v).ok())
        .ok_or_else(|| error_response("need to specify a max"))?;
    let range = KeyRange::new(min, max).map_err(|err| error_response(err.to_string()))?;
    Ok((ns, range))
}

fn range_query(node: &Arc<ShardNode>, cmd: &Doc) -> Doc {
    let (ns, range) = match parse_ns_and_range(cmd) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    let docs: Vec<serde_json::Value> = node
        .store()
        .range_scan(&ns, &range)
        .into_iter()
        .map(Doc::into_value)
        .collect();
    let mut response = Doc::new();
    response.insert("docs", json!(docs));
    response.insert("ok", json!(1));
    response
}

fn list_indexes(node: &Arc<ShardNode>, cmd: &Doc) -> Doc {
    let ns = cmd
        .first()
        .and_then(|(_, v)| v.as_str())
        .filter(|s| !s.is_empty());
    let Some(ns) = ns else {
        return error_response("need to specify namespace");
    };
    let ns = match Namespace::parse(ns) {
        Ok(ns) => ns,
        Err(err) => return error_response(err.to_string()),
    };
    let indexes: Vec<serde_json::Value> = node
        .store()
        .indexes(&ns)
        .into_iter()
        .map(Doc::into_value)
        .collect();
    let mut response = Doc::new();
    response.insert("indexes", json!(indexes));
    response.insert("ok", json!(1));
    response
}

fn transfer_mods(node: &Arc<ShardNode>) -> Doc {
    let budget = node.tunables().transfer_mods_batch_bytes;
    match node.donor().transfer_mods(node.store(), budget) {
        Ok(batch) => match serde_json::to_value(&batch) {
            Ok(serde_json::Value::Object(map)) => {
                let mut response = Doc::from(map);
                response.insert("ok", json!(1));
                response
            }
            _ => error_response("transfer batch encode failed"),
        },
        Err(err) => error_response(err.to_string()),
    }
}

fn recv_chunk_start(node: &Arc<ShardNode>, cmd: &Doc) -> Doc {
    let (ns, range) = match parse_ns_and_range(cmd) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    let Some(from) = cmd.get("from").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
        return error_response("need to specify donor address");
    };

    if let Err(err) = node.recipient().prepare(
        ns,
        from.to_string(),
        range.min.clone(),
        range.max.clone(),
    ) {
        return error_response(err.to_string());
    }

    let worker_node = Arc::clone(node);
    let spawned = thread::Builder::new()
        .name("migrateThread".into())
        .spawn(move || {
            let recipient = worker_node.recipient_arc();
            recipient.go(
                worker_node.store(),
                worker_node.tunables().recipient_steady_sleep(),
            );
        });
    if let Err(err) = spawned {
        node.recipient().fail_to_start(&err.to_string());
        return error_response(format!("failed to spawn migrate worker: {err}"));
    }

    let mut response = Doc::new();
    response.insert("started", json!(true));
    response.insert("ok", json!(1));
    response
}

fn recv_chunk_commit(node: &Arc<ShardNode>) -> Doc {
    let committed = node
        .recipient()
        .start_commit(node.tunables().commit_wait());
    let mut response = node.recipient().status();
    response.insert("ok", json!(if committed { 1 } else { 0 }));
    response
}
