//! Unified `Database` trait: the single async interface for all persistence.
//!
//! Jobs, the provider registry and the ledger live behind one trait so that
//! a settlement can change job status and balances in one unit of work.
//! The only coordination primitive is [`Database::transition_job`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::ledger::{Account, TransferRecord};
use crate::market::model::{Job, PageRequest, Transition};
use crate::market::state::JobStatus;
use crate::registry::Provider;

/// Raw per-provider counts used by the scoreboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTally {
    pub provider_id: String,
    /// Jobs whose frozen snapshot lists the provider.
    pub eligible_count: u64,
    pub claimed_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
}

/// Backend-agnostic database trait covering jobs, providers and the ledger.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), DatabaseError>;

    // ── Providers ───────────────────────────────────────────────────

    /// Insert or replace a provider record.
    async fn upsert_provider(&self, provider: &Provider) -> Result<(), DatabaseError>;

    /// Get a provider by identity.
    async fn get_provider(&self, id: &str) -> Result<Option<Provider>, DatabaseError>;

    /// All providers, ordered by identity.
    async fn list_providers(&self) -> Result<Vec<Provider>, DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job with its eligibility snapshot and first history entry.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by ID, including its full status history.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// List jobs newest first, optionally filtered by status.
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        page: PageRequest,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Count jobs, optionally filtered by status.
    async fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64, DatabaseError>;

    /// Oldest open job `provider` may claim: listed in its snapshot, a task
    /// type the provider currently serves, and a budget covering its rate.
    async fn next_open_job(&self, provider: &Provider) -> Result<Option<Job>, DatabaseError>;

    /// Atomic conditional update. Applies `transition` only if the job is
    /// still in `transition.from` (and, for claims, still unowned with the
    /// claimant in its snapshot; otherwise owned by `transition.provider_id`).
    ///
    /// Returns `Ok(true)` if this call won, `Ok(false)` if the job had moved
    /// on. Under concurrent calls for the same `from`, at most one wins.
    /// An attached transfer is applied in the same unit of work iff it wins.
    async fn transition_job(&self, transition: &Transition) -> Result<bool, DatabaseError>;

    /// Jobs held (`claimed`/`in_progress`) whose last change predates `before`.
    async fn list_stale_jobs(&self, before: DateTime<Utc>) -> Result<Vec<Job>, DatabaseError>;

    /// Eligibility/claim/outcome counts per provider, read-only.
    async fn provider_tallies(&self) -> Result<Vec<ProviderTally>, DatabaseError>;

    // ── Ledger ──────────────────────────────────────────────────────

    /// Balance of `identity` (zero when no account exists).
    async fn balance(&self, identity: &str) -> Result<Decimal, DatabaseError>;

    /// Create an account with `opening` balance unless one exists.
    /// Returns true if the account was created.
    async fn open_account(&self, identity: &str, opening: Decimal) -> Result<bool, DatabaseError>;

    /// Add `amount` to a balance, creating the account if needed.
    async fn deposit(&self, identity: &str, amount: Decimal) -> Result<Decimal, DatabaseError>;

    /// All accounts, ordered by identity.
    async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError>;

    /// Transfers where `identity` paid or was paid, oldest first.
    async fn transfers_for(&self, identity: &str) -> Result<Vec<TransferRecord>, DatabaseError>;
}
