//! Decision consumer: turns a routed request into a validated open job.
//!
//! Nothing is written unless every check passes. The eligibility snapshot is
//! computed here, once, from the live registry and frozen into the job.

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::SubmitError;
use crate::market::model::{Job, RoutingNote, TaskType};
use crate::market::state::JobStatus;
use crate::registry;
use crate::router::Router;
use crate::store::Database;

/// An inbound task submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub requester_id: String,
    /// Optional task type hint; the router decides when absent.
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub budget: Decimal,
}

/// Result of a successful submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub task_type: TaskType,
    pub eligible_agents: Vec<String>,
}

/// Merge router overrides with the request payload. Keys present in the
/// request win.
pub fn merge_payload(
    overrides: &Map<String, Value>,
    request: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = overrides.clone();
    for (key, value) in request {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Check the fields `task_type` requires.
pub fn validate_payload(task_type: TaskType, payload: &Map<String, Value>) -> Result<(), SubmitError> {
    for field in task_type.required_fields() {
        let present = payload
            .get(*field)
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.trim().is_empty());
        if !present {
            return Err(SubmitError::MissingField {
                task_type: task_type.to_string(),
                field: field.to_string(),
            });
        }
    }

    if task_type == TaskType::WebScrape
        && let Some(url) = payload.get("url").and_then(|v| v.as_str())
    {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SubmitError::InvalidField {
                field: "url".to_string(),
                reason: format!("must be an http or https URL, got '{url}'"),
            });
        }
    }
    Ok(())
}

/// Creates jobs from router decisions.
#[derive(Clone)]
pub struct DecisionConsumer {
    db: Arc<dyn Database>,
    router: Arc<dyn Router>,
    enabled: bool,
    starting_balance: Decimal,
}

impl DecisionConsumer {
    pub fn new(db: Arc<dyn Database>, router: Arc<dyn Router>) -> Self {
        Self {
            db,
            router,
            enabled: true,
            starting_balance: Decimal::ZERO,
        }
    }

    /// Builder: accept or refuse submissions.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Builder: credits granted to a requester's new account.
    pub fn with_starting_balance(mut self, balance: Decimal) -> Self {
        self.starting_balance = balance;
        self
    }

    /// Validate, route and persist a submission as an `open` job.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        if !self.enabled {
            return Err(SubmitError::MarketplaceDisabled);
        }

        let requester_id = request.requester_id.trim();
        if requester_id.is_empty() {
            return Err(SubmitError::EmptyRequester);
        }
        if request.budget <= Decimal::ZERO {
            return Err(SubmitError::InvalidBudget(request.budget.to_string()));
        }

        let hint = match request.task_type.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(
                TaskType::from_str(raw).map_err(SubmitError::UnknownTaskType)?,
            ),
            _ => None,
        };

        let mut goal = request.goal.trim().to_string();
        if goal.is_empty() {
            match hint {
                Some(task_type) => goal = format!("{task_type} task"),
                None => return Err(SubmitError::EmptyGoal),
            }
        }

        let decision = self.router.route(&goal, hint).await?;
        let task_type = decision.task_type;
        let payload = merge_payload(&decision.payload_overrides, &request.payload);
        validate_payload(task_type, &payload)?;

        let providers = self.db.list_providers().await?;
        let eligible = registry::eligible(&providers, task_type, request.budget);

        let job = Job::new(requester_id, task_type, goal, payload, request.budget, eligible)
            .with_routing(RoutingNote {
                router: self.router.name().to_string(),
                provider_role: decision.provider_role,
                reasoning: decision.reasoning,
            });

        if self.db.open_account(requester_id, self.starting_balance).await? {
            tracing::info!(
                identity = %requester_id,
                balance = %self.starting_balance,
                "Opened requester account"
            );
        }
        self.db.insert_job(&job).await?;

        if job.eligible_agents.is_empty() {
            tracing::warn!(
                job_id = %job.id,
                task_type = %task_type,
                budget = %job.budget,
                "No provider is eligible; job will stay open"
            );
        } else {
            tracing::info!(
                job_id = %job.id,
                task_type = %task_type,
                budget = %job.budget,
                eligible = ?job.eligible_agents,
                "Job posted"
            );
        }

        Ok(SubmitReceipt {
            job_id: job.id,
            status: job.status,
            task_type,
            eligible_agents: job.eligible_agents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Provider;
    use crate::router::KeywordRouter;
    use crate::store::LibSqlBackend;
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn consumer() -> (DecisionConsumer, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        registry::seed(&db).await.unwrap();
        (DecisionConsumer::new(Arc::clone(&db), Arc::new(KeywordRouter)), db)
    }

    fn request(task_type: Option<&str>, goal: &str, payload: Value, budget: Decimal) -> SubmitRequest {
        SubmitRequest {
            requester_id: "alice".into(),
            task_type: task_type.map(str::to_string),
            goal: goal.into(),
            payload: serde_json::from_value(payload).unwrap(),
            budget,
        }
    }

    #[test]
    fn request_payload_wins_merge() {
        let overrides: Map<String, Value> =
            serde_json::from_value(json!({"url": "https://router.example", "depth": 1})).unwrap();
        let req: Map<String, Value> =
            serde_json::from_value(json!({"url": "https://request.example"})).unwrap();
        let merged = merge_payload(&overrides, &req);
        assert_eq!(merged["url"], "https://request.example");
        assert_eq!(merged["depth"], 1);
    }

    #[tokio::test]
    async fn submit_creates_open_job_with_snapshot() {
        let (consumer, db) = consumer().await;
        let receipt = consumer
            .submit(request(
                Some("web_scrape"),
                "Scrape the page",
                json!({"url": "https://example.com"}),
                dec!(15),
            ))
            .await
            .unwrap();
        assert_eq!(receipt.status, JobStatus::Open);
        assert_eq!(receipt.eligible_agents, vec!["A1"]);

        let job = db.get_job(receipt.job_id).await.unwrap().unwrap();
        assert_eq!(job.routing.unwrap().provider_role, "scraper");
        assert_eq!(job.payload["url"], "https://example.com");
    }

    #[tokio::test]
    async fn router_fills_missing_url() {
        let (consumer, db) = consumer().await;
        let receipt = consumer
            .submit(request(None, "Scrape https://example.org/news", json!({}), dec!(20)))
            .await
            .unwrap();
        assert_eq!(receipt.task_type, TaskType::WebScrape);
        let job = db.get_job(receipt.job_id).await.unwrap().unwrap();
        assert_eq!(job.payload["url"], "https://example.org/news");
    }

    #[tokio::test]
    async fn budget_below_every_rate_gives_empty_snapshot() {
        let (consumer, _db) = consumer().await;
        let receipt = consumer
            .submit(request(
                Some("web_scrape"),
                "cheap scrape",
                json!({"url": "https://example.com"}),
                dec!(3),
            ))
            .await
            .unwrap();
        assert!(receipt.eligible_agents.is_empty());
        assert_eq!(receipt.status, JobStatus::Open);
    }

    #[tokio::test]
    async fn validation_errors_create_nothing() {
        let (consumer, db) = consumer().await;

        let err = consumer
            .submit(request(Some("code_review"), "review", json!({}), dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::UnknownTaskType(t) if t == "code_review"));

        let err = consumer
            .submit(request(Some("web_scrape"), "", json!({}), dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::MissingField { ref field, .. } if field == "url"));

        let err = consumer
            .submit(request(Some("summarize"), "condense this", json!({}), dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::MissingField { ref field, .. } if field == "text"));

        let err = consumer
            .submit(request(Some("web_scrape"), "x", json!({"url": "file:///etc/passwd"}), dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidField { .. }));

        let err = consumer
            .submit(request(Some("generic"), "x", json!({}), dec!(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidBudget(_)));

        let mut empty = request(Some("generic"), "x", json!({}), dec!(1));
        empty.requester_id = "  ".into();
        assert!(matches!(
            consumer.submit(empty).await.unwrap_err(),
            SubmitError::EmptyRequester
        ));

        assert_eq!(db.count_jobs(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disabled_marketplace_rejects() {
        let (consumer, _db) = consumer().await;
        let consumer = consumer.with_enabled(false);
        let err = consumer
            .submit(request(Some("generic"), "hello", json!({}), dec!(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::MarketplaceDisabled));
    }

    #[tokio::test]
    async fn starting_balance_granted_once() {
        let (consumer, db) = consumer().await;
        let consumer = consumer.with_starting_balance(dec!(100));
        for _ in 0..2 {
            consumer
                .submit(request(Some("generic"), "hello", json!({}), dec!(20)))
                .await
                .unwrap();
        }
        assert_eq!(db.balance("alice").await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn snapshot_ignores_later_registry_changes() {
        let (consumer, db) = consumer().await;
        let receipt = consumer
            .submit(request(Some("summarize"), "sum", json!({"text": "A. B."}), dec!(10)))
            .await
            .unwrap();
        assert_eq!(receipt.eligible_agents, vec!["A2"]);

        db.upsert_provider(&Provider::new("A2", "SummarizeGPT", vec![TaskType::Summarize], dec!(50)))
            .await
            .unwrap();
        db.upsert_provider(&Provider::new("Z1", "Newcomer", vec![TaskType::Summarize], dec!(1)))
            .await
            .unwrap();

        let job = db.get_job(receipt.job_id).await.unwrap().unwrap();
        assert_eq!(job.eligible_agents, vec!["A2"]);
    }
}
