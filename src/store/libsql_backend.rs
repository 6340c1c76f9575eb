//! libSQL implementation of the `Database` trait.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared by every caller; writes are serialized behind `write_lock` so a
//! transaction on the shared connection never interleaves with another
//! caller's statements. Conditional updates are expressed in SQL, so the
//! at-most-one-winner guarantee also holds across processes sharing a file.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::ledger::{Account, Transfer, TransferRecord};
use crate::market::model::{Job, PageRequest, RoutingNote, TaskType, Transition};
use crate::market::state::{JobStatus, StatusChange};
use crate::registry::{Provider, ProviderStatus};
use crate::store::migrations;
use crate::store::traits::{Database, ProviderTally};

/// Open jobs fetched per round while searching for a claimable candidate.
const CANDIDATE_BATCH: i64 = 64;

/// How long SQLite waits on another connection's lock before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra attempts for a transition that still found the database busy.
const BUSY_RETRIES: u32 = 3;

const BUSY_BACKOFF: Duration = Duration::from_millis(25);

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        configure_connection(&conn, true).await?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        configure_connection(&conn, false).await?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// One attempt at a transition inside an IMMEDIATE transaction.
    async fn try_transition(&self, transition: &Transition) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| query_err("transition_job begin", e))?;

        match apply_transition(&tx, transition).await {
            Ok(true) => {
                tx.commit()
                    .await
                    .map_err(|e| query_err("transition_job commit", e))?;
                debug!(
                    job_id = %transition.job_id,
                    from = %transition.from,
                    to = %transition.to,
                    actor = %transition.actor,
                    "Job transitioned"
                );
                Ok(true)
            }
            Ok(false) => {
                tx.rollback()
                    .await
                    .map_err(|e| query_err("transition_job rollback", e))?;
                Ok(false)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn load_history(&self, job: &mut Job) -> Result<(), DatabaseError> {
        job.status_history = load_history(self.conn(), job.id).await?;
        Ok(())
    }

    async fn query_jobs(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context} row: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        for job in &mut jobs {
            self.load_history(job).await?;
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed-width, so text order is time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().filter(|s| !s.is_empty()).map(|s| parse_datetime(s))
}

fn parse_decimal(s: &str, field: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(s.trim())
        .map_err(|e| DatabaseError::Serialization(format!("{field} '{s}': {e}")))
}

fn to_json<T: Serialize + ?Sized>(value: &T, field: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str, field: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn optional_json<T: serde::de::DeserializeOwned>(
    s: Option<String>,
    field: &str,
) -> Result<Option<T>, DatabaseError> {
    match s.filter(|s| !s.is_empty()) {
        Some(s) => from_json(&s, field).map(Some),
        None => Ok(None),
    }
}

/// Column list for job SELECT queries (18 columns).
const JOB_COLUMNS: &str = "id, requester_id, provider_id, task_type, goal, payload, budget, status, eligible_agents, routing, result, error, events, created_at, claimed_at, started_at, completed_at, updated_at";

const PROVIDER_COLUMNS: &str = "id, name, capabilities, rate, region, status, updated_at";

/// Set the busy timeout, and WAL mode for file databases so readers do
/// not block the writer.
async fn configure_connection(conn: &Connection, wal: bool) -> Result<(), DatabaseError> {
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| DatabaseError::Pool(format!("busy_timeout: {e}")))?;
    if wal {
        let mut rows = conn
            .query("PRAGMA journal_mode = WAL", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("journal_mode: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Pool(format!("journal_mode: {e}")))?;
    }
    Ok(())
}

fn is_locked(message: &str) -> bool {
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("SQLITE_BUSY")
}

/// Map a libSQL error, surfacing lock contention as `Busy`.
fn query_err(context: &str, e: libsql::Error) -> DatabaseError {
    let message = format!("{context}: {e}");
    if is_locked(&message) {
        DatabaseError::Busy(message)
    } else {
        DatabaseError::Query(message)
    }
}

fn text(row: &libsql::Row, idx: i32, name: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

fn count(row: &libsql::Row, idx: i32, name: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

/// Map a libsql Row (JOB_COLUMNS order) to a Job without its history.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id_str: String = text(row, 0, "job.id")?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job.id parse: {e}")))?;

    let task_type_str: String = text(row, 3, "job.task_type")?;
    let task_type = TaskType::from_str(&task_type_str).map_err(|t| {
        DatabaseError::Serialization(format!("job.task_type: unknown task type {t}"))
    })?;

    let status_str: String = text(row, 7, "job.status")?;
    let status = JobStatus::from_str(&status_str).map_err(DatabaseError::Serialization)?;

    let payload_str: String = text(row, 5, "job.payload")?;
    let budget_str: String = text(row, 6, "job.budget")?;
    let eligible_str: String = text(row, 8, "job.eligible_agents")?;
    let created_str: String = text(row, 13, "job.created_at")?;
    let updated_str: String = text(row, 17, "job.updated_at")?;

    Ok(Job {
        id,
        requester_id: text(row, 1, "job.requester_id")?,
        provider_id: row.get::<String>(2).ok().filter(|s| !s.is_empty()),
        task_type,
        goal: text(row, 4, "job.goal")?,
        payload: from_json(&payload_str, "job.payload")?,
        budget: parse_decimal(&budget_str, "job.budget")?,
        status,
        eligible_agents: from_json(&eligible_str, "job.eligible_agents")?,
        status_history: Vec::new(),
        routing: optional_json::<RoutingNote>(row.get::<String>(9).ok(), "job.routing")?,
        result: optional_json(row.get::<String>(10).ok(), "job.result")?,
        error: optional_json(row.get::<String>(11).ok(), "job.error")?,
        events: optional_json(row.get::<String>(12).ok(), "job.events")?.unwrap_or_default(),
        created_at: parse_datetime(&created_str),
        claimed_at: parse_optional_datetime(&row.get::<String>(14).ok()),
        started_at: parse_optional_datetime(&row.get::<String>(15).ok()),
        completed_at: parse_optional_datetime(&row.get::<String>(16).ok()),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row (PROVIDER_COLUMNS order) to a Provider.
fn row_to_provider(row: &libsql::Row) -> Result<Provider, DatabaseError> {
    let capabilities_str: String = text(row, 2, "provider.capabilities")?;
    let rate_str: String = text(row, 3, "provider.rate")?;
    let status_str: String = text(row, 5, "provider.status")?;
    let updated_str: String = text(row, 6, "provider.updated_at")?;

    Ok(Provider {
        id: text(row, 0, "provider.id")?,
        name: text(row, 1, "provider.name")?,
        capabilities: from_json(&capabilities_str, "provider.capabilities")?,
        rate: parse_decimal(&rate_str, "provider.rate")?,
        region: text(row, 4, "provider.region")?,
        status: ProviderStatus::parse(&status_str),
        updated_at: parse_datetime(&updated_str),
    })
}

async fn load_history(conn: &Connection, job_id: Uuid) -> Result<Vec<StatusChange>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT status, actor, note, created_at FROM job_status_history WHERE job_id = ?1 ORDER BY id ASC",
            params![job_id.to_string()],
        )
        .await
        .map_err(|e| query_err("load_history", e))?;

    let mut history = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| query_err("load_history row", e))?
    {
        let status_str: String = text(&row, 0, "history.status")?;
        let created_str: String = text(&row, 3, "history.created_at")?;
        history.push(StatusChange {
            status: JobStatus::from_str(&status_str).map_err(DatabaseError::Serialization)?,
            actor: text(&row, 1, "history.actor")?,
            note: row.get::<String>(2).ok(),
            timestamp: parse_datetime(&created_str),
        });
    }
    Ok(history)
}

async fn insert_history(
    conn: &Connection,
    job_id: Uuid,
    change: &StatusChange,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO job_status_history (job_id, status, actor, note, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            job_id.to_string(),
            change.status.as_str(),
            change.actor.as_str(),
            change.note.as_deref(),
            ts(&change.timestamp),
        ],
    )
    .await
    .map_err(|e| query_err("insert_history", e))?;
    Ok(())
}

async fn read_balance(conn: &Connection, identity: &str) -> Result<Decimal, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT balance FROM ledger_accounts WHERE identity = ?1",
            params![identity],
        )
        .await
        .map_err(|e| query_err("read_balance", e))?;

    match rows
        .next()
        .await
        .map_err(|e| query_err("read_balance row", e))?
    {
        Some(row) => {
            let balance: String = text(&row, 0, "ledger.balance")?;
            parse_decimal(&balance, "ledger.balance")
        }
        None => Ok(Decimal::ZERO),
    }
}

/// Add `delta` to a balance, creating the account if needed.
async fn adjust_balance(
    conn: &Connection,
    identity: &str,
    delta: Decimal,
    at: &str,
) -> Result<Decimal, DatabaseError> {
    let next = read_balance(conn, identity).await? + delta;
    conn.execute(
        "INSERT INTO ledger_accounts (identity, balance, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(identity) DO UPDATE SET balance = excluded.balance, updated_at = excluded.updated_at",
        params![identity, next.to_string(), at],
    )
    .await
    .map_err(|e| query_err("adjust_balance", e))?;
    Ok(next)
}

async fn apply_transfer(conn: &Connection, transfer: &Transfer, at: &str) -> Result<(), DatabaseError> {
    if transfer.amount <= Decimal::ZERO {
        return Err(DatabaseError::Constraint(format!(
            "transfer for job {} must be positive, got {}",
            transfer.job_id, transfer.amount
        )));
    }

    conn.execute(
        "INSERT INTO ledger_transfers (job_id, from_identity, to_identity, amount, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            transfer.job_id.to_string(),
            transfer.from.as_str(),
            transfer.to.as_str(),
            transfer.amount.to_string(),
            at,
        ],
    )
    .await
    .map_err(|e| DatabaseError::Constraint(format!("ledger transfer for job {}: {e}", transfer.job_id)))?;

    let payer = adjust_balance(conn, &transfer.from, -transfer.amount, at).await?;
    adjust_balance(conn, &transfer.to, transfer.amount, at).await?;

    if payer.is_sign_negative() {
        warn!(
            identity = %transfer.from,
            balance = %payer,
            job_id = %transfer.job_id,
            "Requester overdrawn by settlement"
        );
    }
    Ok(())
}

/// Body of `transition_job`, run inside a transaction.
async fn apply_transition(conn: &Connection, t: &Transition) -> Result<bool, DatabaseError> {
    let at = ts(&t.at);
    let job_id = t.job_id.to_string();

    let changed = if t.to == JobStatus::Claimed {
        let provider = t.provider_id.as_deref().ok_or_else(|| {
            DatabaseError::Constraint(format!("claim of job {} names no provider", t.job_id))
        })?;
        conn.execute(
            "UPDATE jobs SET status = ?1, provider_id = ?2, claimed_at = ?3, updated_at = ?3
             WHERE id = ?4 AND status = ?5 AND provider_id IS NULL
               AND EXISTS (SELECT 1 FROM job_eligibility WHERE job_id = ?4 AND provider_id = ?2)",
            params![t.to.as_str(), provider, at.as_str(), job_id.as_str(), t.from.as_str()],
        )
        .await
        .map_err(|e| query_err("transition_job claim", e))?
    } else {
        let started_at = (t.to == JobStatus::InProgress).then(|| at.clone());
        let completed_at = t.to.is_terminal().then(|| at.clone());
        let result = t.result.as_ref().map(|v| to_json(v, "job.result")).transpose()?;
        let error = t.error.as_ref().map(|v| to_json(v, "job.error")).transpose()?;
        let events = t.events.as_ref().map(|v| to_json(v, "job.events")).transpose()?;

        conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2,
                started_at = COALESCE(?3, started_at),
                completed_at = COALESCE(?4, completed_at),
                result = COALESCE(?5, result),
                error = COALESCE(?6, error),
                events = COALESCE(?7, events)
             WHERE id = ?8 AND status = ?9 AND (?10 IS NULL OR provider_id = ?10)",
            params![
                t.to.as_str(),
                at.as_str(),
                started_at,
                completed_at,
                result,
                error,
                events,
                job_id.as_str(),
                t.from.as_str(),
                t.provider_id.as_deref(),
            ],
        )
        .await
        .map_err(|e| query_err("transition_job", e))?
    };

    if changed == 0 {
        return Ok(false);
    }

    insert_history(
        conn,
        t.job_id,
        &StatusChange {
            status: t.to,
            actor: t.actor.clone(),
            timestamp: t.at,
            note: t.note.clone(),
        },
    )
    .await?;

    if let Some(transfer) = &t.transfer {
        apply_transfer(conn, transfer, &at).await?;
    }
    Ok(true)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("ping: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Pool(format!("ping: {e}")))?;
        Ok(())
    }

    // ── Providers ───────────────────────────────────────────────────

    async fn upsert_provider(&self, provider: &Provider) -> Result<(), DatabaseError> {
        let capabilities = to_json(&provider.capabilities, "provider.capabilities")?;
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO providers (id, name, capabilities, rate, region, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, capabilities = excluded.capabilities,
                    rate = excluded.rate, region = excluded.region, status = excluded.status,
                    updated_at = excluded.updated_at",
                params![
                    provider.id.as_str(),
                    provider.name.as_str(),
                    capabilities,
                    provider.rate.to_string(),
                    provider.region.as_str(),
                    provider.status.as_str(),
                    ts(&provider.updated_at),
                ],
            )
            .await
            .map_err(|e| query_err("upsert_provider", e))?;
        debug!(provider = %provider.id, rate = %provider.rate, "Provider upserted");
        Ok(())
    }

    async fn get_provider(&self, id: &str) -> Result<Option<Provider>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| query_err("get_provider", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_provider(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_provider row: {e}"))),
        }
    }

    async fn list_providers(&self) -> Result<Vec<Provider>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(&format!("SELECT {PROVIDER_COLUMNS} FROM providers ORDER BY id ASC"), ())
            .await
            .map_err(|e| query_err("list_providers", e))?;

        let mut providers = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_err("list_providers row", e))?
        {
            providers.push(row_to_provider(&row)?);
        }
        Ok(providers)
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let payload = to_json(&job.payload, "job.payload")?;
        let eligible = to_json(&job.eligible_agents, "job.eligible_agents")?;
        let routing = job.routing.as_ref().map(|r| to_json(r, "job.routing")).transpose()?;
        let job_id = job.id.to_string();

        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| query_err("insert_job begin", e))?;

        let insert = async {
            tx.execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    job_id.as_str(),
                    job.requester_id.as_str(),
                    job.provider_id.as_deref(),
                    job.task_type.as_str(),
                    job.goal.as_str(),
                    payload,
                    job.budget.to_string(),
                    job.status.as_str(),
                    eligible,
                    routing,
                    job.result.as_ref().map(|v| v.to_string()),
                    job.error.as_ref().map(|v| v.to_string()),
                    Option::<String>::None,
                    ts(&job.created_at),
                    job.claimed_at.as_ref().map(ts),
                    job.started_at.as_ref().map(ts),
                    job.completed_at.as_ref().map(ts),
                    ts(&job.updated_at),
                ],
            )
            .await
            .map_err(|e| query_err("insert_job", e))?;

            for provider_id in &job.eligible_agents {
                tx.execute(
                    "INSERT OR IGNORE INTO job_eligibility (job_id, provider_id) VALUES (?1, ?2)",
                    params![job_id.as_str(), provider_id.as_str()],
                )
                .await
                .map_err(|e| query_err("insert_job eligibility", e))?;
            }

            for change in &job.status_history {
                insert_history(&tx, job.id, change).await?;
            }
            Ok::<(), DatabaseError>(())
        }
        .await;

        match insert {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| query_err("insert_job commit", e))?;
                debug!(job_id = %job.id, task_type = %job.task_type, "Job inserted into DB");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut jobs = self
            .query_jobs(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
                "get_job",
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        page: PageRequest,
    ) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
            ),
            params![
                status.map(|s| s.as_str()),
                i64::from(page.limit),
                i64::from(page.offset)
            ],
            "list_jobs",
        )
        .await
    }

    async fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM jobs WHERE (?1 IS NULL OR status = ?1)",
                params![status.map(|s| s.as_str())],
            )
            .await
            .map_err(|e| query_err("count_jobs", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(count(&row, 0, "count")?.max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_jobs row: {e}"))),
        }
    }

    async fn next_open_job(&self, provider: &Provider) -> Result<Option<Job>, DatabaseError> {
        let mut offset: i64 = 0;
        loop {
            let mut rows = self
                .conn()
                .query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs
                         WHERE status = 'open'
                           AND id IN (SELECT job_id FROM job_eligibility WHERE provider_id = ?1)
                         ORDER BY created_at ASC, rowid ASC LIMIT ?2 OFFSET ?3"
                    ),
                    params![provider.id.as_str(), CANDIDATE_BATCH, offset],
                )
                .await
                .map_err(|e| query_err("next_open_job", e))?;

            let mut fetched = 0;
            while let Some(row) = rows
                .next()
                .await
                .map_err(|e| query_err("next_open_job row", e))?
            {
                fetched += 1;
                let mut job = row_to_job(&row)?;
                if provider.can_service(job.task_type, job.budget) {
                    self.load_history(&mut job).await?;
                    return Ok(Some(job));
                }
            }

            if fetched < CANDIDATE_BATCH {
                return Ok(None);
            }
            offset += CANDIDATE_BATCH;
        }
    }

    async fn transition_job(&self, transition: &Transition) -> Result<bool, DatabaseError> {
        if !transition.is_valid() {
            return Err(DatabaseError::Constraint(format!(
                "job {}: transition {} -> {} is not allowed",
                transition.job_id, transition.from, transition.to
            )));
        }

        let mut attempt = 0;
        loop {
            match self.try_transition(transition).await {
                Err(DatabaseError::Busy(message)) if attempt < BUSY_RETRIES => {
                    attempt += 1;
                    debug!(
                        job_id = %transition.job_id,
                        attempt,
                        %message,
                        "Database busy, retrying transition"
                    );
                    tokio::time::sleep(BUSY_BACKOFF * attempt).await;
                }
                Err(DatabaseError::Busy(message)) if transition.to == JobStatus::Claimed => {
                    warn!(
                        job_id = %transition.job_id,
                        provider = ?transition.provider_id,
                        %message,
                        "Claim abandoned, database stayed busy"
                    );
                    return Ok(false);
                }
                other => return other,
            }
        }
    }

    async fn list_stale_jobs(&self, before: DateTime<Utc>) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE status IN ('claimed', 'in_progress') AND updated_at < ?1
                 ORDER BY updated_at ASC"
            ),
            params![ts(&before)],
            "list_stale_jobs",
        )
        .await
    }

    async fn provider_tallies(&self) -> Result<Vec<ProviderTally>, DatabaseError> {
        let mut tallies: BTreeMap<String, ProviderTally> = BTreeMap::new();

        let mut rows = self
            .conn()
            .query(
                "SELECT provider_id, COUNT(*) FROM job_eligibility GROUP BY provider_id",
                (),
            )
            .await
            .map_err(|e| query_err("provider_tallies eligible", e))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_err("provider_tallies eligible row", e))?
        {
            let provider_id: String = text(&row, 0, "tally.provider_id")?;
            let eligible = count(&row, 1, "tally.eligible")?;
            let tally = tallies.entry(provider_id.clone()).or_default();
            tally.provider_id = provider_id;
            tally.eligible_count = eligible.max(0) as u64;
        }

        let mut rows = self
            .conn()
            .query(
                "SELECT provider_id, COUNT(*),
                    SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END)
                 FROM jobs WHERE provider_id IS NOT NULL GROUP BY provider_id",
                (),
            )
            .await
            .map_err(|e| query_err("provider_tallies claimed", e))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_err("provider_tallies claimed row", e))?
        {
            let provider_id: String = text(&row, 0, "tally.provider_id")?;
            let tally = tallies.entry(provider_id.clone()).or_default();
            tally.provider_id = provider_id;
            tally.claimed_count = count(&row, 1, "tally.claimed")?.max(0) as u64;
            tally.completed_count = count(&row, 2, "tally.completed")?.max(0) as u64;
            tally.failed_count = count(&row, 3, "tally.failed")?.max(0) as u64;
        }

        Ok(tallies.into_values().collect())
    }

    // ── Ledger ──────────────────────────────────────────────────────

    async fn balance(&self, identity: &str) -> Result<Decimal, DatabaseError> {
        read_balance(self.conn(), identity).await
    }

    async fn open_account(&self, identity: &str, opening: Decimal) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let created = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO ledger_accounts (identity, balance, updated_at) VALUES (?1, ?2, ?3)",
                params![identity, opening.to_string(), ts(&Utc::now())],
            )
            .await
            .map_err(|e| query_err("open_account", e))?;
        Ok(created > 0)
    }

    async fn deposit(&self, identity: &str, amount: Decimal) -> Result<Decimal, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| query_err("deposit begin", e))?;

        match adjust_balance(&tx, identity, amount, &ts(&Utc::now())).await {
            Ok(balance) => {
                tx.commit()
                    .await
                    .map_err(|e| query_err("deposit commit", e))?;
                Ok(balance)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT identity, balance, updated_at FROM ledger_accounts ORDER BY identity ASC",
                (),
            )
            .await
            .map_err(|e| query_err("list_accounts", e))?;

        let mut accounts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_err("list_accounts row", e))?
        {
            let balance: String = text(&row, 1, "account.balance")?;
            let updated: String = text(&row, 2, "account.updated_at")?;
            accounts.push(Account {
                identity: text(&row, 0, "account.identity")?,
                balance: parse_decimal(&balance, "account.balance")?,
                updated_at: parse_datetime(&updated),
            });
        }
        Ok(accounts)
    }

    async fn transfers_for(&self, identity: &str) -> Result<Vec<TransferRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT job_id, from_identity, to_identity, amount, created_at FROM ledger_transfers
                 WHERE from_identity = ?1 OR to_identity = ?1 ORDER BY id ASC",
                params![identity],
            )
            .await
            .map_err(|e| query_err("transfers_for", e))?;

        let mut transfers = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_err("transfers_for row", e))?
        {
            let job_id: String = text(&row, 0, "transfer.job_id")?;
            let amount: String = text(&row, 3, "transfer.amount")?;
            let created: String = text(&row, 4, "transfer.created_at")?;
            transfers.push(TransferRecord {
                job_id: Uuid::parse_str(&job_id)
                    .map_err(|e| DatabaseError::Serialization(format!("transfer.job_id: {e}")))?,
                from: text(&row, 1, "transfer.from")?,
                to: text(&row, 2, "transfer.to")?,
                amount: parse_decimal(&amount, "transfer.amount")?,
                created_at: parse_datetime(&created),
            });
        }
        Ok(transfers)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
