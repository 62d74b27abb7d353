//! Transaction-log recovery: gap-triggered catchup, cold-start catchup, and
//! the administrative reset.

use std::sync::Arc;

use tracing::{info, warn};

use crate::context::NodeContext;
use crate::errors::{Error, Result};
use crate::protos::LogEntry;

/// Resolves the leader, pulls every entry past our local tail, and applies
/// them as one atomic batch. Called both on a detected gap mid-multicast and
/// on cold start.
pub async fn recover(ctx: &Arc<NodeContext>) -> Result<()> {
    let leader = ctx
        .membership
        .resolve_leader(ctx.config.max_retries, ctx.config.retry_backoff())
        .await?;

    let storage = ctx.storage.clone();
    let last_id = tokio::task::spawn_blocking(move || storage.last_applied_pid())
        .await
        .map_err(|e| Error::FatalLocal(e.to_string()))??;

    info!(leader = leader.id, last_id, "starting recovery catchup");

    let entries: Vec<LogEntry> = ctx
        .http
        .get(format!("http://{}/logs?last_id={}", leader.address, last_id))
        .send()
        .await
        .map_err(|e| Error::Transient(e.to_string()))?
        .json()
        .await
        .map_err(|e| Error::Transient(e.to_string()))?;

    if entries.is_empty() {
        return Ok(());
    }

    let storage = ctx.storage.clone();
    let applied_through = entries.last().map(|e| e.id);
    tokio::task::spawn_blocking(move || storage.apply_batch(&entries))
        .await
        .map_err(|e| Error::FatalLocal(e.to_string()))??;

    info!(through = ?applied_through, "recovery catchup applied");
    Ok(())
}

/// On bootup: if this replica has already applied writes (PID > 0) and the
/// cluster currently has a leader, close any gap that opened while we were
/// down. A fresh replica (PID == 0) needs no recovery.
pub async fn cold_start(ctx: &Arc<NodeContext>) -> Result<()> {
    let storage = ctx.storage.clone();
    let last_id = tokio::task::spawn_blocking(move || storage.last_applied_pid())
        .await
        .map_err(|e| Error::FatalLocal(e.to_string()))??;

    if last_id == 0 {
        return Ok(());
    }

    match ctx.membership.resolve_leader(ctx.config.max_retries, ctx.config.retry_backoff()).await {
        Ok(_) => recover(ctx).await,
        Err(e) => {
            warn!(error = %e, "no leader available yet, skipping cold-start catchup");
            Ok(())
        }
    }
}

/// Administrative reset: wipes log and state rows and restarts the
/// log sequence at 1. Out-of-band, not part of normal operation.
pub async fn reset(ctx: &Arc<NodeContext>) -> Result<()> {
    let storage = ctx.storage.clone();
    tokio::task::spawn_blocking(move || storage.reset())
        .await
        .map_err(|e| Error::FatalLocal(e.to_string()))??;
    info!("reset: log and state wiped, sequence restarted at 1");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn cold_start_skips_fresh_replica() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut config = Config::for_test(1);
        config.data_dir = dir.to_str().unwrap().to_string();
        let ctx = Arc::new(NodeContext::new(config).unwrap());
        // A fresh replica has PID 0 and must not attempt to contact anything.
        cold_start(&ctx).await.unwrap();
    }
}
