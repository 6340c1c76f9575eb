//! Marketplace data model: jobs, task types, transitions and paging.

use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::executor::event::Event;
use crate::ledger::Transfer;
use crate::market::state::{JobStatus, StatusChange};

/// Actor recorded for transitions made by the stale sweep.
pub const SWEEPER_ACTOR: &str = "sweeper";

/// Current time truncated to microseconds, the precision the store keeps.
pub fn timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Capability tag a job requires and a provider declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    WebScrape,
    Summarize,
    SentimentAnalysis,
    Generic,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::WebScrape,
        TaskType::Summarize,
        TaskType::SentimentAnalysis,
        TaskType::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebScrape => "web_scrape",
            Self::Summarize => "summarize",
            Self::SentimentAnalysis => "sentiment_analysis",
            Self::Generic => "generic",
        }
    }

    /// Payload fields a submission of this type must carry.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::WebScrape => &["url"],
            Self::Summarize | Self::SentimentAnalysis => &["text"],
            Self::Generic => &[],
        }
    }

    /// Role name the router reports for this task type.
    pub fn provider_role(&self) -> &'static str {
        match self {
            Self::WebScrape => "scraper",
            Self::Summarize => "summarizer",
            Self::SentimentAnalysis => "analyst",
            Self::Generic => "generalist",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "web_scrape" | "web_scraping" | "scrape" => Ok(Self::WebScrape),
            "summarize" | "summarise" | "summarization" => Ok(Self::Summarize),
            "sentiment_analysis" | "sentiment" => Ok(Self::SentimentAnalysis),
            "generic" => Ok(Self::Generic),
            _ => Err(s.to_string()),
        }
    }
}

/// Routing context captured from the decision that created a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingNote {
    pub router: String,
    pub provider_role: String,
    pub reasoning: String,
}

/// A marketplace job record.
///
/// Created once by intake, mutated only through [`Transition`]s, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub requester_id: String,
    /// Set exactly once, by the claim.
    pub provider_id: Option<String>,
    pub task_type: TaskType,
    pub goal: String,
    pub payload: Map<String, Value>,
    pub budget: Decimal,
    pub status: JobStatus,
    /// Providers matching task type and budget at creation. Frozen.
    pub eligible_agents: Vec<String>,
    pub status_history: Vec<StatusChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingNote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new open job with its eligibility snapshot.
    pub fn new(
        requester_id: impl Into<String>,
        task_type: TaskType,
        goal: impl Into<String>,
        payload: Map<String, Value>,
        budget: Decimal,
        eligible_agents: Vec<String>,
    ) -> Self {
        let now = timestamp();
        let requester_id = requester_id.into();
        Self {
            id: Uuid::new_v4(),
            status_history: vec![StatusChange {
                status: JobStatus::Open,
                actor: requester_id.clone(),
                timestamp: now,
                note: None,
            }],
            requester_id,
            provider_id: None,
            task_type,
            goal: goal.into(),
            payload,
            budget,
            status: JobStatus::Open,
            eligible_agents,
            routing: None,
            result: None,
            error: None,
            events: Vec::new(),
            created_at: now,
            claimed_at: None,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Builder: attach routing context.
    pub fn with_routing(mut self, routing: RoutingNote) -> Self {
        self.routing = Some(routing);
        self
    }

    /// Whether `provider_id` was in the frozen eligibility snapshot.
    pub fn is_eligible(&self, provider_id: &str) -> bool {
        self.eligible_agents.iter().any(|p| p == provider_id)
    }
}

/// An atomic conditional status change: applied only if the job is still in
/// `from`. A transfer attached to a transition is applied in the same unit of
/// work, and only when the transition wins.
#[derive(Debug, Clone)]
pub struct Transition {
    pub job_id: Uuid,
    pub from: JobStatus,
    pub to: JobStatus,
    pub actor: String,
    pub at: DateTime<Utc>,
    /// Claims stamp this; later transitions require it to match.
    pub provider_id: Option<String>,
    pub note: Option<String>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub events: Option<Vec<Event>>,
    pub transfer: Option<Transfer>,
}

impl Transition {
    fn new(job_id: Uuid, from: JobStatus, to: JobStatus, actor: impl Into<String>) -> Self {
        Self {
            job_id,
            from,
            to,
            actor: actor.into(),
            at: timestamp(),
            provider_id: None,
            note: None,
            result: None,
            error: None,
            events: None,
            transfer: None,
        }
    }

    /// `open → claimed`, stamping the provider.
    pub fn claim(job_id: Uuid, provider_id: &str) -> Self {
        let mut t = Self::new(job_id, JobStatus::Open, JobStatus::Claimed, provider_id);
        t.provider_id = Some(provider_id.to_string());
        t
    }

    /// `claimed → in_progress` by the claiming provider.
    pub fn start(job_id: Uuid, provider_id: &str) -> Self {
        let mut t = Self::new(job_id, JobStatus::Claimed, JobStatus::InProgress, provider_id);
        t.provider_id = Some(provider_id.to_string());
        t
    }

    /// `in_progress → completed` with result, events and the ledger transfer.
    pub fn complete(
        job_id: Uuid,
        provider_id: &str,
        result: Value,
        events: Vec<Event>,
        transfer: Transfer,
    ) -> Self {
        let mut t = Self::new(job_id, JobStatus::InProgress, JobStatus::Completed, provider_id);
        t.provider_id = Some(provider_id.to_string());
        t.result = Some(result);
        t.events = Some(events);
        t.transfer = Some(transfer);
        t
    }

    /// `from → failed` with an error payload. Never carries a transfer.
    pub fn fail(
        job_id: Uuid,
        from: JobStatus,
        actor: &str,
        provider_id: Option<&str>,
        error: Value,
        events: Vec<Event>,
    ) -> Self {
        let mut t = Self::new(job_id, from, JobStatus::Failed, actor);
        t.provider_id = provider_id.map(str::to_string);
        t.error = Some(error);
        t.events = Some(events);
        t
    }

    /// Builder: annotate the history entry.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Whether the state machine allows this transition at all.
    pub fn is_valid(&self) -> bool {
        self.from.can_transition_to(self.to) && (self.to != JobStatus::Failed || self.transfer.is_none())
    }
}

/// Paging parameters for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: u32,
    pub offset: u32,
}

impl PageRequest {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self {
            limit: limit.clamp(1, crate::config::MAX_PAGE_LIMIT),
            offset,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(50, 0)
    }
}

/// One page of jobs, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}
