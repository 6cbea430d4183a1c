//! Idle reaper — periodic sweep that terminates processes with no recent
//! activity.
//!
//! Reclamation is polling-based: a sweep runs on a fixed interval, so a
//! process may outlive its idle timeout by up to one interval. That slack
//! is acceptable; what matters is that idle containers are reclaimed at
//! all. A process reaped between two calls is transparently relaunched by
//! the next get-or-create.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::{DEFAULT_IDLE_TIMEOUT_SECS, Registry};
use crate::pool::ProcessPool;

/// Run sweeps every `interval` until `cancel` fires.
pub async fn run_idle_reaper(
    pool: Arc<ProcessPool>,
    registry: Arc<Registry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("idle reaper stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {
                let reaped = sweep(&pool, &registry).await;
                if reaped > 0 {
                    tracing::info!(count = reaped, "reaped idle processes");
                }
            }
        }
    }
}

/// One sweep: terminate every process idle past its server's timeout.
/// Returns the number of processes reaped.
pub async fn sweep(pool: &ProcessPool, registry: &Registry) -> usize {
    let now = Utc::now();
    let mut reaped = 0;

    for snapshot in pool.list().await {
        let timeout_secs = registry
            .get(&snapshot.id)
            .map(|spec| spec.idle_timeout)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);

        let idle = now.signed_duration_since(snapshot.last_used);
        if idle.num_seconds() >= timeout_secs as i64 {
            tracing::info!(
                server = %snapshot.id,
                idle_secs = idle.num_seconds(),
                timeout_secs,
                "reaping idle process"
            );
            if pool.terminate(&snapshot.id).await {
                reaped += 1;
            }
        }
    }
    reaped
}
