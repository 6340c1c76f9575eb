//! Stale sweep. Fails jobs a provider has held for too long.
//!
//! A provider that crashes after claiming leaves its job `claimed` or
//! `in_progress` forever. When enabled, the sweep fails such jobs with a
//! `stale` error. It never moves credits and never reopens a job.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::market::model::{SWEEPER_ACTOR, Transition, timestamp};
use crate::store::Database;

/// Fail every held job whose last transition is older than `stale_after`.
/// Returns how many jobs were failed.
pub async fn sweep_stale_jobs(db: &dyn Database, stale_after: Duration) -> Result<usize, DatabaseError> {
    let threshold = chrono::Duration::from_std(stale_after)
        .map_err(|e| DatabaseError::Query(format!("stale threshold out of range: {e}")))?;
    let before = timestamp() - threshold;

    let stale = db.list_stale_jobs(before).await?;
    if stale.is_empty() {
        debug!("No stale jobs");
        return Ok(0);
    }

    let mut failed = 0;
    for job in stale {
        let error = json!({
            "kind": "stale",
            "message": format!(
                "no progress from {} for over {}s while {}",
                job.provider_id.as_deref().unwrap_or("unknown provider"),
                stale_after.as_secs(),
                job.status
            ),
        });
        let transition = Transition::fail(job.id, job.status, SWEEPER_ACTOR, None, error, job.events.clone())
            .with_note("stale");

        if db.transition_job(&transition).await? {
            warn!(
                job_id = %job.id,
                provider = job.provider_id.as_deref().unwrap_or(""),
                from = %job.status,
                "Stale job failed"
            );
            failed += 1;
        } else {
            debug!(job_id = %job.id, "Stale job moved on before the sweep");
        }
    }
    Ok(failed)
}

/// Spawn the stale sweep background loop. Runs every `interval` until
/// `shutdown` flips to true or its sender is dropped.
pub fn spawn_stale_sweep(
    db: Arc<dyn Database>,
    stale_after: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            stale_after_secs = stale_after.as_secs(),
            interval_secs = interval.as_secs(),
            "Stale sweep started"
        );

        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match sweep_stale_jobs(db.as_ref(), stale_after).await {
                        Ok(0) => {}
                        Ok(n) => info!(count = n, "Stale sweep failed jobs"),
                        Err(e) => warn!(error = %e, "Stale sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Stale sweep stopped");
    })
}
