//! Resolves a job to its executor and runs it under a timeout.
//!
//! The adapter holds no lock. The only thing protecting a running job is its
//! `in_progress` status in the store, which other provider loops never
//! contend on.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;

use crate::error::ExecutorError;
use crate::executor::event::{Event, EventKind, EventLog};
use crate::executor::registry::ExecutorRegistry;
use crate::executor::ExecutionRequest;
use crate::market::model::Job;

/// Outcome of one execution attempt plus its ordered event log.
#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: Result<Value, ExecutorError>,
    pub events: Vec<Event>,
}

impl Execution {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Dispatches jobs to capability executors under a timeout.
#[derive(Debug, Clone)]
pub struct ExecutionAdapter {
    executors: Arc<ExecutorRegistry>,
    timeout: Duration,
}

impl ExecutionAdapter {
    pub fn new(executors: Arc<ExecutorRegistry>, timeout: Duration) -> Self {
        Self { executors, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `job` on behalf of `provider_id`. Never panics and never returns
    /// early: every failure mode ends up in `Execution::outcome`, and the
    /// events recorded before a failure are kept.
    pub async fn run(&self, job: &Job, provider_id: &str) -> Execution {
        let mut log = EventLog::new();
        log.message(format!("{provider_id} received request: {}", job.task_type));

        let Some(executor) = self.executors.get(job.task_type) else {
            let err = ExecutorError::Unsupported(job.task_type.to_string());
            log.push(Event::new(EventKind::Error, err.to_string()).with_metadata("kind", err.kind()));
            return Execution {
                outcome: Err(err),
                events: log.into_events(),
            };
        };

        let request = ExecutionRequest::from_job(job, provider_id);
        let started = Instant::now();

        let run = AssertUnwindSafe(executor.execute(&request, &mut log)).catch_unwind();
        let outcome = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(Ok(value))) if value.is_object() => Ok(value),
            Ok(Ok(Ok(other))) => Err(ExecutorError::MalformedOutput(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_panic)) => Err(ExecutorError::Failed("executor panicked".to_string())),
            Err(_elapsed) => Err(ExecutorError::Timeout(self.timeout)),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => {
                log.push(
                    Event::new(EventKind::Result, "Execution completed")
                        .with_metadata("elapsed_ms", elapsed_ms),
                );
                tracing::debug!(job_id = %job.id, provider = %provider_id, elapsed_ms, "Execution succeeded");
            }
            Err(e) => {
                log.push(
                    Event::new(EventKind::Error, e.to_string())
                        .with_metadata("kind", e.kind())
                        .with_metadata("elapsed_ms", elapsed_ms),
                );
                tracing::warn!(
                    job_id = %job.id,
                    provider = %provider_id,
                    kind = e.kind(),
                    error = %e,
                    "Execution failed"
                );
            }
        }

        Execution {
            outcome,
            events: log.into_events(),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
