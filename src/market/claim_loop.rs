//! Provider claim loop, one per provider, polling for work.
//!
//! Each cycle selects the oldest open job the provider may take, tries the
//! atomic `open → claimed` transition, immediately moves the job to
//! `in_progress`, executes it and settles. Loops share nothing but the
//! store, so any number of them can run in one process or many.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, Error};
use crate::executor::ExecutionAdapter;
use crate::market::model::Transition;
use crate::market::settlement::{self, SettleOutcome};
use crate::store::Database;

/// What one claim cycle did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cycle", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// No eligible open job.
    Idle,
    /// The provider is missing from the registry or not active.
    ProviderUnavailable,
    /// Another provider claimed the candidate first.
    LostRace { job_id: Uuid },
    /// Claimed, but the job left `claimed` before execution could start.
    Abandoned { job_id: Uuid },
    /// Claimed, executed and settled.
    Settled { job_id: Uuid, outcome: SettleOutcome },
}

/// The claim-execute-settle cycle for one provider.
pub struct ProviderLoop {
    provider_id: String,
    db: Arc<dyn Database>,
    adapter: ExecutionAdapter,
    poll_interval: Duration,
    poll_jitter: Duration,
}

impl ProviderLoop {
    pub fn new(provider_id: impl Into<String>, db: Arc<dyn Database>, adapter: ExecutionAdapter) -> Self {
        Self {
            provider_id: provider_id.into(),
            db,
            adapter,
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::ZERO,
        }
    }

    /// Builder: backoff after an idle cycle.
    pub fn with_backoff(mut self, interval: Duration, jitter: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_jitter = jitter;
        self
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Run a single cycle. A lost race is not an error.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, Error> {
        let Some(provider) = self.db.get_provider(&self.provider_id).await? else {
            return Ok(CycleOutcome::ProviderUnavailable);
        };
        if !provider.is_active() {
            return Ok(CycleOutcome::ProviderUnavailable);
        }

        let Some(job) = self.db.next_open_job(&provider).await? else {
            return Ok(CycleOutcome::Idle);
        };

        if !self.db.transition_job(&Transition::claim(job.id, &provider.id)).await? {
            debug!(job_id = %job.id, provider = %provider.id, "Lost claim race");
            return Ok(CycleOutcome::LostRace { job_id: job.id });
        }
        info!(job_id = %job.id, provider = %provider.id, task_type = %job.task_type, "Job claimed");

        if !self.db.transition_job(&Transition::start(job.id, &provider.id)).await? {
            warn!(job_id = %job.id, provider = %provider.id, "Job left claimed before start");
            return Ok(CycleOutcome::Abandoned { job_id: job.id });
        }

        let execution = self.adapter.run(&job, &provider.id).await;
        let outcome = settlement::settle(self.db.as_ref(), &job, &provider.id, execution).await?;
        Ok(CycleOutcome::Settled {
            job_id: job.id,
            outcome,
        })
    }

    /// Fixed interval plus random jitter.
    fn backoff(&self) -> Duration {
        let jitter_ms = self.poll_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.poll_interval;
        }
        self.poll_interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Cycle until `shutdown` flips to true or its sender is dropped.
    /// A running execution is finished and settled before stopping.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(provider = %self.provider_id, "Provider loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let backoff = match self.run_cycle().await {
                Ok(CycleOutcome::LostRace { .. })
                | Ok(CycleOutcome::Abandoned { .. })
                | Ok(CycleOutcome::Settled { .. }) => continue,
                Ok(CycleOutcome::Idle) => self.backoff(),
                Ok(CycleOutcome::ProviderUnavailable) => {
                    debug!(provider = %self.provider_id, "Provider unavailable");
                    self.backoff()
                }
                Err(e) => {
                    error!(provider = %self.provider_id, error = %e, "Claim cycle failed");
                    self.backoff()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(provider = %self.provider_id, "Provider loop stopped");
    }
}

/// Spawn one provider loop.
pub fn spawn_provider_loop(
    provider_loop: ProviderLoop,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(provider_loop.run(shutdown))
}

/// Spawn a loop for every active provider in the registry.
pub async fn spawn_active_provider_loops(
    db: Arc<dyn Database>,
    adapter: ExecutionAdapter,
    poll_interval: Duration,
    poll_jitter: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>, DatabaseError> {
    let providers = db.list_providers().await?;
    let handles: Vec<JoinHandle<()>> = providers
        .iter()
        .filter(|p| p.is_active())
        .map(|p| {
            let provider_loop = ProviderLoop::new(p.id.clone(), Arc::clone(&db), adapter.clone())
                .with_backoff(poll_interval, poll_jitter);
            spawn_provider_loop(provider_loop, shutdown.clone())
        })
        .collect();
    info!(count = handles.len(), "Provider loops spawned");
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorRegistry;
    use crate::market::model::{Job, TaskType};
    use crate::market::state::JobStatus;
    use crate::registry::{Provider, ProviderStatus};
    use crate::store::LibSqlBackend;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::Map;

    async fn setup() -> (Arc<dyn Database>, ExecutionAdapter) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = Arc::new(ExecutorRegistry::with_builtins(Duration::from_secs(5)));
        (db, ExecutionAdapter::new(registry, Duration::from_secs(5)))
    }

    async fn generic_job(db: &Arc<dyn Database>, budget: Decimal, eligible: &[&str]) -> Job {
        let job = Job::new(
            "alice",
            TaskType::Generic,
            "say hi",
            Map::new(),
            budget,
            eligible.iter().map(|s| s.to_string()).collect(),
        );
        db.insert_job(&job).await.unwrap();
        job
    }

    fn generalist(id: &str, rate: Decimal) -> Provider {
        Provider::new(id, id, vec![TaskType::Generic], rate)
    }

    #[tokio::test]
    async fn idle_when_nothing_to_do() {
        let (db, adapter) = setup().await;
        db.upsert_provider(&generalist("A3", dec!(12))).await.unwrap();
        let provider_loop = ProviderLoop::new("A3", db, adapter);
        assert_eq!(provider_loop.run_cycle().await.unwrap(), CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn unknown_or_inactive_provider_is_unavailable() {
        let (db, adapter) = setup().await;
        let provider_loop = ProviderLoop::new("ghost", Arc::clone(&db), adapter.clone());
        assert_eq!(
            provider_loop.run_cycle().await.unwrap(),
            CycleOutcome::ProviderUnavailable
        );

        db.upsert_provider(&generalist("A5", dec!(1)).with_status(ProviderStatus::Idle))
            .await
            .unwrap();
        let provider_loop = ProviderLoop::new("A5", db, adapter);
        assert_eq!(
            provider_loop.run_cycle().await.unwrap(),
            CycleOutcome::ProviderUnavailable
        );
    }

    #[tokio::test]
    async fn cycle_claims_executes_and_settles() {
        let (db, adapter) = setup().await;
        db.upsert_provider(&generalist("A3", dec!(12))).await.unwrap();
        db.deposit("alice", dec!(30)).await.unwrap();
        let job = generic_job(&db, dec!(12), &["A3"]).await;

        let provider_loop = ProviderLoop::new("A3", Arc::clone(&db), adapter);
        let outcome = provider_loop.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Settled {
                job_id: job.id,
                outcome: SettleOutcome::Completed {
                    transferred: dec!(12)
                },
            }
        );

        let stored = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        let statuses: Vec<JobStatus> = stored.status_history.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                JobStatus::Open,
                JobStatus::Claimed,
                JobStatus::InProgress,
                JobStatus::Completed
            ]
        );
        assert!(!stored.events.is_empty());
        assert_eq!(db.balance("A3").await.unwrap(), dec!(12));
        assert_eq!(db.balance("alice").await.unwrap(), dec!(18));
    }

    #[tokio::test]
    async fn concurrent_cycles_settle_once() {
        let (db, adapter) = setup().await;
        let ids = ["P1", "P2", "P3", "P4", "P5", "P6"];
        for id in ids {
            db.upsert_provider(&generalist(id, dec!(1))).await.unwrap();
        }
        let job = generic_job(&db, dec!(5), &ids).await;

        let loops: Vec<ProviderLoop> = ids
            .iter()
            .map(|id| ProviderLoop::new(*id, Arc::clone(&db), adapter.clone()))
            .collect();
        let outcomes = futures::future::join_all(loops.iter().map(|l| l.run_cycle())).await;

        let settled = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(CycleOutcome::Settled { .. })))
            .count();
        assert_eq!(settled, 1);
        for outcome in &outcomes {
            assert!(matches!(
                outcome,
                Ok(CycleOutcome::Settled { .. } | CycleOutcome::LostRace { .. } | CycleOutcome::Idle)
            ));
        }

        let stored = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.is_eligible(stored.provider_id.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (db, adapter) = setup().await;
        db.upsert_provider(&generalist("A3", dec!(1))).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = spawn_provider_loop(
            ProviderLoop::new("A3", db, adapter)
                .with_backoff(Duration::from_millis(10), Duration::from_millis(5)),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn spawns_only_active_providers() {
        let (db, adapter) = setup().await;
        db.upsert_provider(&generalist("A3", dec!(1))).await.unwrap();
        db.upsert_provider(&generalist("A5", dec!(1)).with_status(ProviderStatus::Disabled))
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let handles = spawn_active_provider_loops(
            db,
            adapter,
            Duration::from_millis(10),
            Duration::ZERO,
            rx,
        )
        .await
        .unwrap();
        assert_eq!(handles.len(), 1);
        drop(tx);
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
