//! Generic executor: acknowledges the goal and echoes the payload.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ExecutorError;
use crate::executor::event::EventLog;
use crate::executor::{CapabilityExecutor, ExecutionRequest};
use crate::market::model::TaskType;

#[derive(Debug)]
pub struct GenericExecutor;

#[async_trait]
impl CapabilityExecutor for GenericExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Generic
    }

    fn description(&self) -> &str {
        "Acknowledge a free-form goal and echo its payload"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        events: &mut EventLog,
    ) -> Result<Value, ExecutorError> {
        events.status(format!("Handling goal: {}", request.goal));
        Ok(json!({
            "acknowledged": true,
            "goal": request.goal,
            "payload": request.payload,
            "handled_by": request.provider_id,
        }))
    }
}
