//! Donor-side moveChunk coordinator.
//!
//! The seven-step handoff, run under the distributed lock for the
//! namespace:
//!
//! 1. parse and validate the request
//! 2. acquire the distributed lock
//! 3. sanity-check chunk ownership against the config store
//! 4. open donor write capture (scoped)
//! 5. start the recipient
//! 6. wait for the recipient to reach steady state
//! 7. critical section: bump the local version, commit the recipient, flip
//!    ownership in the config store, bump a residual chunk, audit
//!
//! then tear down capture and delete the migrated range locally.

use std::sync::Arc;
use std::thread;

use serde_json::json;

use crate::configstore::ChangeLogEntry;
use crate::core::{ChunkId, Doc, KeyRange, LockName, Namespace, ShardId, WallTime};
use crate::distlock::TryLock;
use crate::node::ShardNode;
use crate::rpc::{error_response, ok_response, response_errmsg, response_ok, ShardClient};

use super::donor::CaptureGuard;

struct MoveChunkRequest {
    ns: Namespace,
    to: ShardId,
    from: ShardId,
    range: KeyRange,
    chunk_id: ChunkId,
}

/// Entry point for the `moveChunk` command, called on the donor.
pub fn move_chunk(node: &Arc<ShardNode>, cmd: &Doc) -> Doc {
    // 1. parse options
    let request = match parse_request(cmd) {
        Ok(request) => request,
        Err(response) => return response,
    };
    tracing::info!(
        ns = %request.ns,
        from = %request.from,
        to = %request.to,
        range = %request.range,
        "got movechunk"
    );

    // 2. make sure my view is complete and lock
    let lock = node.dist_lock(LockName::from(&request.ns));
    let why = format!("migrate-{:?}", request.range.min);
    let _lock_guard = match lock.try_lock(&why) {
        Ok(TryLock::Got(guard)) => guard,
        Ok(TryLock::Busy(record)) => {
            let mut response = error_response("someone else has the lock");
            if let Ok(who) = serde_json::to_value(&record) {
                response.insert("who", who);
            }
            return response;
        }
        Err(err) => return error_response(format!("lock acquisition failed: {err}")),
    };

    let config = node.config_store();

    let max_version = match config.max_chunk_version(&request.ns) {
        Ok(Some(version)) => version,
        Ok(None) => return error_response(format!("no chunks for {}", request.ns)),
        Err(err) => return error_response(format!("config read failed: {err}")),
    };
    let chunk = match config.find_chunk(&request.chunk_id) {
        Ok(Some(chunk)) => chunk,
        Ok(None) => return error_response(format!("no such chunk {}", request.chunk_id)),
        Err(err) => return error_response(format!("config read failed: {err}")),
    };
    if chunk.shard != request.from {
        let mut response = error_response("i'm out of date");
        response.insert("from", json!(request.from.as_str()));
        response.insert("official", json!(chunk.shard.as_str()));
        return response;
    }
    let my_old_version = node.version(&request.ns);
    if max_version < my_old_version {
        let mut response = error_response("official version less than mine?");
        response.insert("officialVersion", json!(max_version.as_raw()));
        response.insert("myVersion", json!(my_old_version.as_raw()));
        return response;
    }

    // 3. start migrate
    let capture_guard = match CaptureGuard::new(
        node.donor(),
        request.ns.clone(),
        request.range.min.clone(),
        request.range.max.clone(),
    ) {
        Ok(guard) => guard,
        Err(err) => return error_response(err.to_string()),
    };

    let recipient = ShardClient::new(request.to.as_str());
    match recipient.recv_chunk_start(&request.ns, request.from.as_str(), &request.range) {
        Ok(response) if response_ok(&response) => {}
        Ok(response) => {
            let mut out = error_response(format!(
                "_recvChunkStart failed: {}",
                response_errmsg(&response)
            ));
            out.insert("cause", response.into_value());
            return out;
        }
        Err(err) => return error_response(format!("_recvChunkStart failed: {err}")),
    }

    // 4. pause till migrate caught up
    let mut steady = false;
    for _ in 0..node.tunables().steady_poll_max_iterations {
        thread::sleep(node.tunables().steady_poll_interval());
        let status = match recipient.recv_chunk_status() {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!("recipient status poll failed: {err}");
                continue;
            }
        };
        tracing::debug!(status = ?status, "_recvChunkStatus");
        match status.get("state").and_then(|v| v.as_str()) {
            Some("steady") => {
                steady = true;
                break;
            }
            Some("fail") => {
                let mut out = error_response("migrate failed on recipient");
                out.insert("cause", status.into_value());
                return out;
            }
            _ => {}
        }
    }
    if !steady {
        return error_response("timed out waiting for recipient to reach steady state");
    }

    // 5. LOCK: the critical section. From here until the config update
    // lands, this shard's in-memory version and the config metadata move
    // together; routing-side retries cover the brief window.
    node.donor().set_in_critical_section(true);

    let my_version = max_version.next();
    if let Err(err) = node.set_version(&request.ns, my_version) {
        return error_response(format!("version bump refused: {err}"));
    }
    tracing::info!(ns = %request.ns, version = %my_version, "moveChunk locking myself");

    // 5.b finish migrate
    match recipient.recv_chunk_commit() {
        Ok(response) if response_ok(&response) => {}
        Ok(response) => {
            tracing::warn!(cause = ?response, "_recvChunkCommit failed");
            let mut out = error_response("_recvChunkCommit failed!");
            out.insert("cause", response.into_value());
            return out;
        }
        Err(err) => return error_response(format!("_recvChunkCommit failed! {err}")),
    }

    // 5.c update config server. The recipient has committed; a config
    // failure past this point leaves two nodes believing different truths
    // and needs an operator.
    if let Err(err) = config.set_chunk_owner(&request.chunk_id, &request.to, my_version) {
        return critical_section_failure(&request, err);
    }

    // Bump a residual chunk so routers see a fresh top version for this
    // shard and refresh their view; with no residual chunk the shard is
    // empty for this namespace and resets to zero.
    match config.highest_chunk_for_shard(&request.ns, &request.from) {
        Ok(Some(residual)) => {
            let bumped = my_version.next();
            if let Err(err) = config.set_chunk_version(&residual.id, bumped) {
                return critical_section_failure(&request, err);
            }
            if let Err(err) = node.set_version(&request.ns, bumped) {
                return error_response(format!("version bump refused: {err}"));
            }
            tracing::info!(ns = %request.ns, version = %bumped, "moveChunk updating self");
        }
        Ok(None) => {
            node.reset_version(&request.ns);
            tracing::info!(ns = %request.ns, "moveChunk now i'm empty");
        }
        Err(err) => return critical_section_failure(&request, err),
    }

    node.donor().set_in_critical_section(false);

    // 5.d audit
    let mut details = Doc::new();
    details.insert("min", request.range.min.clone().into_value());
    details.insert("max", request.range.max.clone().into_value());
    details.insert("from", json!(request.from.as_str()));
    details.insert("to", json!(request.to.as_str()));
    if let Err(err) = config.log_change(ChangeLogEntry {
        what: "moveChunk".into(),
        ns: request.ns.clone(),
        details,
        time: config.now().unwrap_or_else(|_| WallTime::now()),
    }) {
        tracing::warn!("moveChunk changelog append failed: {err}");
    }

    drop(capture_guard);

    // 6. in-flight cursors over the range may still observe partial data
    // until they expire; deletion does not wait for them.
    tracing::warn!(ns = %request.ns, "deleting migrated range without waiting for cursor drain");

    // 7. remove data locally
    let num_deleted = node.store().remove_range(&request.ns, &request.range);
    tracing::info!(ns = %request.ns, num_deleted, "moveChunk deleted local range");

    let mut response = ok_response();
    response.insert("numDeleted", json!(num_deleted));
    response
}

fn critical_section_failure(
    request: &MoveChunkRequest,
    err: crate::configstore::ConfigStoreError,
) -> Doc {
    tracing::error!(
        ns = %request.ns,
        chunk = %request.chunk_id,
        "config update failed after recipient commit; ownership metadata \
         and recipient state disagree, operator intervention required: {err}"
    );
    let mut response = error_response(format!(
        "critical section commit failed after recipient commit: {err}"
    ));
    response.insert("fatal", json!(true));
    response
}

fn parse_request(cmd: &Doc) -> Result<MoveChunkRequest, Doc> {
    let ns_raw = match cmd.first() {
        Some((name, value)) if name.as_str() == "moveChunk" => value.as_str().unwrap_or(""),
        _ => "",
    };
    if ns_raw.is_empty() {
        return Err(error_response("need to specify namespace in command"));
    }
    let ns = Namespace::parse(ns_raw).map_err(|err| error_response(err.to_string()))?;

    let to = field_str(cmd, "to")
        .ok_or_else(|| error_response("need to specify server to move chunk to"))?;
    let from = field_str(cmd, "from")
        .ok_or_else(|| error_response("need to specify server to move chunk from"))?;
    let min = field_doc(cmd, "min").ok_or_else(|| error_response("need to specify a min"))?;
    let max = field_doc(cmd, "max").ok_or_else(|| error_response("need to specify a max"))?;
    let chunk_id =
        field_str(cmd, "shardId").ok_or_else(|| error_response("need shardId"))?;

    let to = ShardId::new(to).map_err(|err| error_response(err.to_string()))?;
    let from = ShardId::new(from).map_err(|err| error_response(err.to_string()))?;
    let range = KeyRange::new(min, max).map_err(|err| error_response(err.to_string()))?;
    let chunk_id = ChunkId::new(chunk_id).map_err(|err| error_response(err.to_string()))?;

    Ok(MoveChunkRequest {
        ns,
        to,
        from,
        range,
        chunk_id,
    })
}

fn field_str(doc: &Doc, key: &str) -> Option<String> {
    doc.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn field_doc(doc: &Doc, key: &str) -> Option<Doc> {
    doc.get(key)
        .cloned()
        .and_then(|v| Doc::from_value(v).ok())
        .filter(|d| !d.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> Doc {
        Doc::from_value(json!({
            "moveChunk": "test.foo",
            "to": "b:1",
            "from": "a:1",
            "min": {"k": 0},
            "max": {"k": 100},
            "shardId": "test.foo-k_0",
        }))
        .unwrap()
    }

    #[test]
    fn parse_accepts_a_complete_request() {
        let request = parse_request(&base_request()).ok().unwrap();
        assert_eq!(request.ns.as_str(), "test.foo");
        assert_eq!(request.to.as_str(), "b:1");
        assert_eq!(request.chunk_id.as_str(), "test.foo-k_0");
    }

    #[test]
    fn parse_rejects_missing_fields() {
        for (key, errmsg) in [
            ("to", "need to specify server to move chunk to"),
            ("from", "need to specify server to move chunk from"),
            ("min", "need to specify a min"),
            ("max", "need to specify a max"),
            ("shardId", "need shardId"),
        ] {
            let mut cmd = base_request();
            cmd.remove(key);
            let response = parse_request(&cmd).err().unwrap();
            assert_eq!(response_errmsg(&response), errmsg, "missing {key}");
        }
    }

    #[test]
    fn parse_rejects_empty_namespace_and_bounds() {
        let cmd = Doc::from_value(json!({"moveChunk": "", "to": "b:1"})).unwrap();
        let response = parse_request(&cmd).err().unwrap();
        assert_eq!(response_errmsg(&response), "need to specify namespace in command");

        let mut cmd = base_request();
        cmd.insert("min", json!({}));
        assert!(parse_request(&cmd).is_err());
    }
}
