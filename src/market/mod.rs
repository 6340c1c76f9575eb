//! Job-lifecycle engine: intake, claiming, settlement and read models.

pub mod claim_loop;
pub mod intake;
pub mod model;
pub mod scoreboard;
pub mod settlement;
pub mod state;
pub mod sweep;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MarketConfig;
use crate::error::{DatabaseError, Error, JobError, RegistryError, SubmitError};
use crate::ledger::Ledger;
use crate::registry::{self, Provider, ProviderRegistration};
use crate::router::Router;
use crate::store::Database;

pub use claim_loop::{CycleOutcome, ProviderLoop, spawn_active_provider_loops, spawn_provider_loop};
pub use intake::{DecisionConsumer, SubmitReceipt, SubmitRequest};
pub use model::{Job, JobPage, PageRequest, TaskType, Transition};
pub use scoreboard::ProviderScore;
pub use settlement::SettleOutcome;
pub use state::{JobStatus, StatusChange};
pub use sweep::{spawn_stale_sweep, sweep_stale_jobs};

/// Health of the marketplace as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceStatus {
    pub enabled: bool,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The surface exposed to collaborators: submit, query and report.
#[derive(Clone)]
pub struct Marketplace {
    db: Arc<dyn Database>,
    intake: DecisionConsumer,
    ledger: Ledger,
    enabled: bool,
    page_limit: u32,
}

impl Marketplace {
    pub fn new(db: Arc<dyn Database>, router: Arc<dyn Router>, config: &MarketConfig) -> Self {
        let intake = DecisionConsumer::new(Arc::clone(&db), router)
            .with_enabled(config.enabled)
            .with_starting_balance(config.starting_balance);
        Self {
            ledger: Ledger::new(Arc::clone(&db)),
            db,
            intake,
            enabled: config.enabled,
            page_limit: config.page_limit,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Validate and post a new job.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        self.intake.submit(request).await
    }

    /// Full job record including status history.
    pub async fn get(&self, id: Uuid) -> Result<Job, Error> {
        Ok(self
            .db
            .get_job(id)
            .await?
            .ok_or(JobError::NotFound { id })?)
    }

    /// One page of jobs, newest first. `limit` defaults to the configured
    /// page size.
    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<JobPage, DatabaseError> {
        let page = PageRequest::new(limit.unwrap_or(self.page_limit), offset.unwrap_or(0));
        let jobs = self.db.list_jobs(status, page).await?;
        let total = self.db.count_jobs(status).await?;
        Ok(JobPage {
            jobs,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    /// Every registered provider, ordered by identity.
    pub async fn providers(&self) -> Result<Vec<Provider>, DatabaseError> {
        self.db.list_providers().await
    }

    pub async fn provider(&self, id: &str) -> Result<Option<Provider>, DatabaseError> {
        self.db.get_provider(id).await
    }

    /// Add or update a provider. Jobs already posted keep their snapshot.
    pub async fn register_provider(
        &self,
        registration: ProviderRegistration,
    ) -> Result<Provider, RegistryError> {
        registry::register(self.db.as_ref(), registration).await
    }

    /// Per-provider competition stats.
    pub async fn scoreboard(&self) -> Result<Vec<ProviderScore>, DatabaseError> {
        scoreboard::scoreboard(self.db.as_ref()).await
    }

    /// Whether submissions are accepted and the store is reachable.
    pub async fn marketplace_status(&self) -> MarketplaceStatus {
        match self.db.ping().await {
            Ok(()) => MarketplaceStatus {
                enabled: self.enabled,
                online: true,
                error: None,
            },
            Err(e) => {
                tracing::error!(error = %e, "Store unreachable");
                MarketplaceStatus {
                    enabled: self.enabled,
                    online: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
