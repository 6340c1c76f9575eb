//! Capability executors and the adapter that dispatches jobs to them.
//!
//! One executor per task type, selected through an explicit registry.
//! Executors report failure through [`ExecutorError`]; the adapter turns
//! timeouts and panics into the same error channel so nothing escapes a
//! provider loop.

pub mod adapter;
pub mod builtin;
pub mod event;
pub mod registry;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::market::model::{Job, TaskType};

pub use adapter::{Execution, ExecutionAdapter};
pub use event::{Event, EventKind, EventLog};
pub use registry::ExecutorRegistry;

/// Everything an executor is given about the job it runs.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: Uuid,
    pub task_type: TaskType,
    pub goal: String,
    pub payload: Map<String, Value>,
    pub requester_id: String,
    pub provider_id: String,
}

impl ExecutionRequest {
    pub fn from_job(job: &Job, provider_id: &str) -> Self {
        Self {
            job_id: job.id,
            task_type: job.task_type,
            goal: job.goal.clone(),
            payload: job.payload.clone(),
            requester_id: job.requester_id.clone(),
            provider_id: provider_id.to_string(),
        }
    }
}

/// A capability implementation for one task type.
#[async_trait]
pub trait CapabilityExecutor: Send + Sync + std::fmt::Debug {
    /// The task type this executor services.
    fn task_type(&self) -> TaskType;

    fn description(&self) -> &str;

    /// Run the capability. Progress goes into `events`; the returned value
    /// must be a JSON object.
    async fn execute(
        &self,
        request: &ExecutionRequest,
        events: &mut EventLog,
    ) -> Result<Value, ExecutorError>;
}

/// Extract a required non-empty string field from a payload.
pub fn require_str<'a>(payload: &'a Map<String, Value>, field: &str) -> Result<&'a str, ExecutorError> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ExecutorError::InvalidPayload(format!("missing '{field}' string field")))
}
