//! Settlement: finalize a job's status and move credits exactly once.
//!
//! Success and failure are both a single conditional transition out of
//! `in_progress`. The ledger transfer rides on the success transition, so it
//! is applied iff that transition wins. A second settlement of the same job
//! loses the conditional update and changes nothing.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, JobError};
use crate::executor::Execution;
use crate::ledger::Transfer;
use crate::market::model::{Job, Transition};
use crate::market::state::JobStatus;
use crate::store::Database;

/// What a settlement call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettleOutcome {
    /// Job completed and `transferred` credits moved requester → provider.
    Completed { transferred: Decimal },
    /// Job failed; no credits moved.
    Failed,
    /// The job was already terminal. Nothing changed.
    AlreadySettled { status: JobStatus },
}

/// Settle `job` for `provider_id` with the result of its execution.
pub async fn settle(
    db: &dyn Database,
    job: &Job,
    provider_id: &str,
    execution: Execution,
) -> Result<SettleOutcome, Error> {
    let Execution { outcome, events } = execution;

    let (transition, settled) = match outcome {
        Ok(result) => (
            Transition::complete(
                job.id,
                provider_id,
                result,
                events,
                Transfer::new(job.id, job.requester_id.as_str(), provider_id, job.budget),
            ),
            SettleOutcome::Completed {
                transferred: job.budget,
            },
        ),
        Err(e) => (
            Transition::fail(
                job.id,
                JobStatus::InProgress,
                provider_id,
                Some(provider_id),
                e.to_payload(),
                events,
            ),
            SettleOutcome::Failed,
        ),
    };

    if db.transition_job(&transition).await? {
        match &settled {
            SettleOutcome::Completed { transferred } => info!(
                job_id = %job.id,
                provider = %provider_id,
                requester = %job.requester_id,
                amount = %transferred,
                "Job completed and settled"
            ),
            _ => info!(job_id = %job.id, provider = %provider_id, "Job failed; no credits moved"),
        }
        return Ok(settled);
    }

    let current = db
        .get_job(job.id)
        .await?
        .ok_or(JobError::NotFound { id: job.id })?;

    if current.status.is_terminal() {
        warn!(
            job_id = %job.id,
            provider = %provider_id,
            status = %current.status,
            "Duplicate settlement ignored"
        );
        return Ok(SettleOutcome::AlreadySettled {
            status: current.status,
        });
    }

    Err(JobError::InvalidTransition {
        id: job.id,
        state: current.status.to_string(),
        target: transition.to.to_string(),
    }
    .into())
}
