//! Routing oracle: decides which capability a free-text goal needs.
//!
//! The engine treats the router as opaque: it trusts the returned task type
//! and merges `payload_overrides` under the request payload. `KeywordRouter`
//! is the built-in oracle used when nothing smarter is configured.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RouterError;
use crate::market::model::TaskType;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]+"#).expect("valid url regex"));

static SENTIMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(sentiment|feel|feeling|feelings|opinion|mood|tone)\b")
        .expect("valid sentiment regex")
});

static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(summar\w*|tl;?dr|condense|digest)\b").expect("valid summary regex")
});

static SCRAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(scrape|scraping|crawl|fetch|extract)\b").expect("valid scrape regex")
});

/// What the router decided for one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterDecision {
    pub provider_role: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub payload_overrides: Map<String, Value>,
    pub reasoning: String,
}

/// A routing oracle.
#[async_trait]
pub trait Router: Send + Sync {
    /// Name recorded on jobs this router created.
    fn name(&self) -> &str;

    /// Decide the task type for `goal`, honoring `hint` when given.
    async fn route(&self, goal: &str, hint: Option<TaskType>) -> Result<RouterDecision, RouterError>;
}

/// Keyword and URL heuristics. Trusts an explicit hint.
#[derive(Debug, Default, Clone)]
pub struct KeywordRouter;

impl KeywordRouter {
    pub fn new() -> Self {
        Self
    }

    fn infer(goal: &str) -> (TaskType, &'static str) {
        if SENTIMENT_RE.is_match(goal) {
            (TaskType::SentimentAnalysis, "goal asks about sentiment")
        } else if SUMMARY_RE.is_match(goal) {
            (TaskType::Summarize, "goal asks for a summary")
        } else if URL_RE.is_match(goal) || SCRAPE_RE.is_match(goal) {
            (TaskType::WebScrape, "goal references a web page")
        } else {
            (TaskType::Generic, "no specific capability detected")
        }
    }
}

#[async_trait]
impl Router for KeywordRouter {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn route(&self, goal: &str, hint: Option<TaskType>) -> Result<RouterDecision, RouterError> {
        let goal = goal.trim();
        if goal.is_empty() && hint.is_none() {
            return Err(RouterError::Undecided {
                router: self.name().to_string(),
                reason: "empty goal and no task type hint".to_string(),
            });
        }

        let (task_type, reasoning) = match hint {
            Some(task_type) => (task_type, "explicit task type requested".to_string()),
            None => {
                let (task_type, why) = Self::infer(goal);
                (task_type, why.to_string())
            }
        };

        let mut payload_overrides = Map::new();
        match task_type {
            TaskType::WebScrape => {
                if let Some(url) = URL_RE.find(goal) {
                    let url = url.as_str().trim_end_matches(['.', ',', ')', ';']);
                    payload_overrides.insert("url".into(), Value::String(url.to_string()));
                }
            }
            // A hinted text task names its own input; the goal is only an
            // instruction then.
            TaskType::Summarize | TaskType::SentimentAnalysis
                if hint.is_none() && !goal.is_empty() =>
            {
                payload_overrides.insert("text".into(), Value::String(goal.to_string()));
            }
            _ => {}
        }

        tracing::debug!(task_type = %task_type, reasoning = %reasoning, "Routed goal");
        Ok(RouterDecision {
            provider_role: task_type.provider_role().to_string(),
            task_type,
            payload_overrides,
            reasoning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hint_is_trusted() {
        let decision = KeywordRouter
            .route("summarize https://example.com", Some(TaskType::WebScrape))
            .await
            .unwrap();
        assert_eq!(decision.task_type, TaskType::WebScrape);
        assert_eq!(decision.provider_role, "scraper");
        assert_eq!(decision.payload_overrides["url"], "https://example.com");
    }

    #[tokio::test]
    async fn infers_from_keywords() {
        let cases = [
            ("Scrape https://news.ycombinator.com.", TaskType::WebScrape),
            ("Summarize this article for me", TaskType::Summarize),
            ("How do people feel about the launch?", TaskType::SentimentAnalysis),
            ("Validate my spreadsheet", TaskType::Generic),
        ];
        for (goal, expected) in cases {
            let decision = KeywordRouter.route(goal, None).await.unwrap();
            assert_eq!(decision.task_type, expected, "goal: {goal}");
        }
    }

    #[tokio::test]
    async fn strips_trailing_punctuation_from_url() {
        let decision = KeywordRouter
            .route("Scrape https://news.ycombinator.com.", None)
            .await
            .unwrap();
        assert_eq!(decision.payload_overrides["url"], "https://news.ycombinator.com");
    }

    #[tokio::test]
    async fn empty_goal_without_hint_is_undecided() {
        let err = KeywordRouter.route("   ", None).await.unwrap_err();
        assert!(matches!(err, RouterError::Undecided { .. }));
    }

    #[tokio::test]
    async fn inferred_text_task_uses_goal_as_text() {
        let decision = KeywordRouter
            .route("Summarize: the ice is thin this year.", None)
            .await
            .unwrap();
        assert_eq!(decision.task_type, TaskType::Summarize);
        assert_eq!(
            decision.payload_overrides["text"],
            "Summarize: the ice is thin this year."
        );
    }

    #[tokio::test]
    async fn hinted_text_task_leaves_text_to_the_request() {
        let decision = KeywordRouter
            .route("condense this", Some(TaskType::Summarize))
            .await
            .unwrap();
        assert!(!decision.payload_overrides.contains_key("text"));
    }
}
