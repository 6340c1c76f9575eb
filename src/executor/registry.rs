//! Registry mapping each task type to its executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::executor::CapabilityExecutor;
use crate::executor::builtin::{
    GenericExecutor, SentimentExecutor, SummarizeExecutor, WebScrapeExecutor,
};
use crate::market::model::TaskType;

/// Registry of capability executors, keyed by task type.
#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn CapabilityExecutor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with one built-in executor per task type.
    pub fn with_builtins(http_timeout: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WebScrapeExecutor::new(http_timeout)));
        registry.register(Arc::new(SummarizeExecutor));
        registry.register(Arc::new(SentimentExecutor));
        registry.register(Arc::new(GenericExecutor));
        registry
    }

    /// Register an executor, replacing any previous one for its task type.
    pub fn register(&mut self, executor: Arc<dyn CapabilityExecutor>) {
        let task_type = executor.task_type();
        if self.executors.insert(task_type, executor).is_some() {
            tracing::debug!(task_type = %task_type, "Replaced executor");
        } else {
            tracing::debug!(task_type = %task_type, "Registered executor");
        }
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn CapabilityExecutor>> {
        self.executors.get(&task_type).cloned()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.executors.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
