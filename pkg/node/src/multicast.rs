//! Spanning-tree multicast of writes: leader send path,
//! follower receive-forward-apply path, retrying fan-out POSTs tolerant of
//! partial failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::NodeContext;
use crate::errors::{Error, Result};
use crate::protos::{MulticastMessage, Pid, QueryType, ServerId, WriteRequest};
use crate::recovery;
use crate::tree::SpanningTree;

/// Leader send path: append, apply, reconcile the tree, fan out to
/// direct children. Returns the assigned PID.
pub async fn send_write(ctx: &Arc<NodeContext>, req: WriteRequest) -> Result<Pid> {
    if !ctx.election.is_leader().await {
        return Err(Error::Rejected("not the current leader".into()));
    }

    let storage = ctx.storage.clone();
    let pid = tokio::task::spawn_blocking(move || storage.last_applied_pid().map(|p| p + 1))
        .await
        .map_err(|e| Error::FatalLocal(e.to_string()))??;

    let storage = ctx.storage.clone();
    let (query_type, table, query, args) = (req.query_type, req.table.clone(), req.query.clone(), req.args.clone());
    tokio::task::spawn_blocking(move || storage.apply_one(pid, query_type, &table, &query, &args))
        .await
        .map_err(|e| Error::FatalLocal(e.to_string()))??;

    info!(pid, table = %req.table, "applied write at leader");

    let msg = MulticastMessage {
        query: req.query,
        args: req.args,
        pid,
        query_type: req.query_type,
        table: req.table,
        source_node: ctx.self_id.to_string(),
        message_id: Uuid::new_v4().to_string(),
    };
    ctx.dedup.check_and_insert(&msg.message_id);

    let ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = fan_out(ctx, msg).await {
            warn!(error = %e, "multicast fan-out failed");
        }
    });

    Ok(pid)
}

/// Follower receive path. Returns once the message has been applied
/// (or recognized as a duplicate/loop); fan-out to this node's own children
/// happens in the background after the caller replies to its parent.
pub async fn receive(ctx: &Arc<NodeContext>, msg: MulticastMessage) -> Result<()> {
    if ctx.dedup.check_and_insert(&msg.message_id) {
        debug!(message_id = %msg.message_id, "duplicate multicast, not re-applied");
        return Ok(());
    }
    if msg.source_node == ctx.self_id.to_string() {
        debug!(message_id = %msg.message_id, "dropping multicast that originated from self");
        return Ok(());
    }

    let storage = ctx.storage.clone();
    let mut last_pid = tokio::task::spawn_blocking(move || storage.last_applied_pid())
        .await
        .map_err(|e| Error::FatalLocal(e.to_string()))??;

    if msg.pid != last_pid + 1 {
        info!(expected = last_pid + 1, got = msg.pid, "gap detected, triggering recovery");
        recovery::recover(ctx).await?;

        let storage = ctx.storage.clone();
        last_pid = tokio::task::spawn_blocking(move || storage.last_applied_pid())
            .await
            .map_err(|e| Error::FatalLocal(e.to_string()))??;

        if msg.pid != last_pid + 1 {
            return Err(Error::Rejected(format!(
                "still missing entries after recovery: have {last_pid}, need {}",
                msg.pid - 1
            )));
        }
    }

    let storage = ctx.storage.clone();
    let (query_type, table, query, args, pid) =
        (msg.query_type, msg.table.clone(), msg.query.clone(), msg.args.clone(), msg.pid);
    tokio::task::spawn_blocking(move || storage.apply_one(pid, query_type, &table, &query, &args))
        .await
        .map_err(|e| Error::FatalLocal(e.to_string()))??;

    let ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = fan_out(ctx, msg).await {
            warn!(error = %e, "downstream fan-out failed");
        }
    });

    Ok(())
}

/// Reconciles `tree` against the current membership snapshot using the
/// spanning tree's incremental add/remove operations rather than always
/// rebuilding from scratch.
async fn reconcile_tree(tree: &mut SpanningTree, members: &HashMap<ServerId, String>, leader: ServerId) {
    if tree.is_empty() || tree.leader() != Some(leader) {
        tree.rebuild(members, leader);
        return;
    }

    let to_remove: Vec<ServerId> = tree
        .print_tree()
        .into_iter()
        .map(|n| n.id)
        .filter(|id| *id != leader && !members.contains_key(id))
        .collect();
    for id in to_remove {
        tree.remove_node(id);
    }

    let to_add: Vec<(ServerId, String)> = members
        .iter()
        .filter(|(id, _)| **id != leader && !tree.contains(**id))
        .map(|(id, addr)| (*id, addr.clone()))
        .collect();
    for (id, addr) in to_add {
        tree.add_node(id, addr);
    }
}

async fn fan_out(ctx: Arc<NodeContext>, msg: MulticastMessage) -> Result<()> {
    let members = ctx.membership.members().await?;
    let address_map: HashMap<ServerId, String> = members.iter().map(|(id, m)| (*id, m.address.clone())).collect();
    let leader = members.values().find(|m| m.is_leader).map(|m| m.id).unwrap_or(ctx.self_id);

    let children = {
        let mut tree = ctx.tree.write().await;
        reconcile_tree(&mut tree, &address_map, leader).await;
        tree.find(ctx.self_id).map(|n| n.children).unwrap_or_default()
    };

    if children.is_empty() {
        return Ok(());
    }

    let deadline = ctx.config.multicast_timeout();
    let result = tokio::time::timeout(deadline, async {
        let mut handles = Vec::with_capacity(children.len());
        for child in children {
            let Some(addr) = address_map.get(&child).cloned() else { continue };
            let ctx = ctx.clone();
            let msg = msg.clone();
            handles.push(tokio::spawn(async move { send_to_child(&ctx, child, &addr, &msg).await }));
        }

        let mut any_ok = false;
        let mut all_attempted = 0;
        for handle in handles {
            all_attempted += 1;
            match handle.await {
                Ok(Ok(())) => any_ok = true,
                Ok(Err(e)) => warn!(error = %e, "child send failed after retries"),
                Err(e) => warn!(error = %e, "child send task panicked"),
            }
        }
        (any_ok, all_attempted)
    })
    .await;

    match result {
        Ok((_, 0)) => Ok(()),
        Ok((true, _)) => Ok(()),
        Ok((false, _)) => Err(Error::Transient("all children failed multicast send".into())),
        Err(_) => Err(Error::Transient("multicast fan-out timed out".into())),
    }
}

async fn send_to_child(ctx: &Arc<NodeContext>, child: ServerId, addr: &str, msg: &MulticastMessage) -> Result<()> {
    let url = format!("http://{addr}/recvMulticast");
    let mut attempt = 0;
    loop {
        match ctx.http.post(&url).json(msg).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => {
                let status = resp.status();
                if attempt >= ctx.config.max_retries {
                    return Err(Error::Transient(format!("child {child} returned {status}")));
                }
            }
            Err(e) => {
                if attempt >= ctx.config.max_retries {
                    return Err(Error::Transient(format!("child {child} unreachable: {e}")));
                }
            }
        }
        attempt += 1;
        tokio::time::sleep(backoff_for(ctx.config.retry_backoff(), attempt)).await;
    }
}

fn backoff_for(base: Duration, _attempt: u32) -> Duration {
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::NodeContext;

    fn test_ctx(node_id: u64) -> Arc<NodeContext> {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut config = Config::for_test(node_id);
        config.data_dir = dir.to_str().unwrap().to_string();
        Arc::new(NodeContext::new(config).unwrap())
    }

    #[tokio::test]
    async fn duplicate_message_is_not_reapplied() {
        let ctx = test_ctx(1);
        let msg = MulticastMessage {
            query: "q".into(),
            args: vec![],
            pid: 1,
            query_type: QueryType::Insert,
            table: "users".into(),
            source_node: "2".into(),
            message_id: "m1".into(),
        };
        receive(&ctx, msg.clone()).await.unwrap();
        receive(&ctx, msg).await.unwrap();

        let storage = ctx.storage.clone();
        let pid = tokio::task::spawn_blocking(move || storage.last_applied_pid()).await.unwrap().unwrap();
        assert_eq!(pid, 1);
    }

    #[tokio::test]
    async fn message_from_self_is_dropped() {
        let ctx = test_ctx(3);
        let msg = MulticastMessage {
            query: "q".into(),
            args: vec![],
            pid: 1,
            query_type: QueryType::Insert,
            table: "users".into(),
            source_node: "3".into(),
            message_id: "m2".into(),
        };
        receive(&ctx, msg).await.unwrap();
        let storage = ctx.storage.clone();
        let pid = tokio::task::spawn_blocking(move || storage.last_applied_pid()).await.unwrap().unwrap();
        assert_eq!(pid, 0);
    }
}
