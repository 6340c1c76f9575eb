//! Extractive summarizer: keeps the leading sentences of `payload.text`.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use crate::error::ExecutorError;
use crate::executor::event::EventLog;
use crate::executor::{CapabilityExecutor, ExecutionRequest, require_str};
use crate::market::model::TaskType;

const DEFAULT_MAX_SENTENCES: usize = 3;
const MAX_SENTENCES_CAP: usize = 20;

static SENTENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]*").expect("valid sentence regex"));

/// Split text into trimmed, non-empty sentences.
pub fn split_sentences(text: &str) -> Vec<String> {
    SENTENCE_RE
        .find_iter(text)
        .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|s| s.chars().any(char::is_alphanumeric))
        .collect()
}

#[derive(Debug)]
pub struct SummarizeExecutor;

#[async_trait]
impl CapabilityExecutor for SummarizeExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Summarize
    }

    fn description(&self) -> &str {
        "Extractive summary of the leading sentences of a text"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        events: &mut EventLog,
    ) -> Result<Value, ExecutorError> {
        let text = require_str(&request.payload, "text")?;
        let max_sentences = match request.payload.get("max_sentences") {
            None | Some(Value::Null) => DEFAULT_MAX_SENTENCES,
            Some(v) => v
                .as_u64()
                .filter(|n| *n > 0)
                .map(|n| (n as usize).min(MAX_SENTENCES_CAP))
                .ok_or_else(|| {
                    ExecutorError::InvalidPayload(format!(
                        "max_sentences must be a positive integer, got {v}"
                    ))
                })?,
        };

        let sentences = split_sentences(text);
        events.status(format!(
            "Summarizing {} sentences down to at most {max_sentences}",
            sentences.len()
        ));

        let kept: Vec<&String> = sentences.iter().take(max_sentences).collect();
        let summary = kept.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ");

        Ok(json!({
            "summary": summary,
            "sentences_total": sentences.len(),
            "sentences_used": kept.len(),
            "word_count": text.split_whitespace().count(),
            "summary_word_count": summary.split_whitespace().count(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::model::Job;
    use rust_decimal_macros::dec;
    use serde_json::Map;

    fn request(payload: Value) -> ExecutionRequest {
        let payload: Map<String, Value> = serde_json::from_value(payload).unwrap();
        let job = Job::new("bob", TaskType::Summarize, "summarize", payload, dec!(8), vec![]);
        ExecutionRequest::from_job(&job, "A2")
    }

    #[test]
    fn splits_on_terminal_punctuation() {
        let sentences = split_sentences("One. Two!  Three?\nFour");
        assert_eq!(sentences, vec!["One.", "Two!", "Three?", "Four"]);
    }

    #[tokio::test]
    async fn keeps_leading_sentences() {
        let text = "Rust is fast. It is also safe. Cargo is nice. Crates are plentiful.";
        let mut events = EventLog::new();
        let out = SummarizeExecutor
            .execute(&request(json!({"text": text, "max_sentences": 2})), &mut events)
            .await
            .unwrap();
        assert_eq!(out["summary"], "Rust is fast. It is also safe.");
        assert_eq!(out["sentences_total"], 4);
        assert_eq!(out["sentences_used"], 2);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn defaults_to_three_sentences() {
        let mut events = EventLog::new();
        let out = SummarizeExecutor
            .execute(&request(json!({"text": "A. B. C. D. E."})), &mut events)
            .await
            .unwrap();
        assert_eq!(out["sentences_used"], 3);
    }

    #[tokio::test]
    async fn rejects_bad_max_sentences() {
        let mut events = EventLog::new();
        let err = SummarizeExecutor
            .execute(&request(json!({"text": "A.", "max_sentences": "lots"})), &mut events)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidPayload(_)));
    }
}
