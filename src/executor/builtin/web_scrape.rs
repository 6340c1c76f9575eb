//! Web scraping executor: fetch a page and extract title, links and text.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::ExecutorError;
use crate::executor::event::{Event, EventKind, EventLog};
use crate::executor::{CapabilityExecutor, ExecutionRequest, require_str};
use crate::market::model::TaskType;

/// Maximum characters of visible text kept in the excerpt.
const MAX_EXCERPT_CHARS: usize = 500;

/// Maximum number of links returned.
const MAX_LINKS: usize = 20;

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title regex"));

static NON_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<head\b.*?</head>|<!--.*?-->")
        .expect("valid non-text regex")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"'#][^"']*)["']"#).expect("valid link regex")
});

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid ws regex"));

/// What the scraper pulls out of a page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSummary {
    pub title: Option<String>,
    pub link_count: usize,
    pub links: Vec<String>,
    pub excerpt: String,
    pub word_count: usize,
}

/// Extract title, links and a visible-text excerpt from raw HTML.
pub fn extract_page(html: &str) -> PageSummary {
    let title = TITLE_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| collapse_whitespace(&decode_entities(m.as_str())))
        .filter(|t| !t.is_empty());

    let visible = NON_TEXT_RE.replace_all(html, " ");
    let all_links: Vec<String> = LINK_RE
        .captures_iter(&visible)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
        .collect();

    let stripped = TAG_RE.replace_all(&visible, " ");
    let text = collapse_whitespace(&decode_entities(&stripped));
    let word_count = text.split_whitespace().count();
    let excerpt: String = text.chars().take(MAX_EXCERPT_CHARS).collect();

    PageSummary {
        title,
        link_count: all_links.len(),
        links: all_links.into_iter().take(MAX_LINKS).collect(),
        excerpt,
        word_count,
    }
}

fn collapse_whitespace(s: &str) -> String {
    WS_RE.replace_all(s, " ").trim().to_string()
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Fetches `payload.url` over HTTP(S).
#[derive(Debug)]
pub struct WebScrapeExecutor {
    client: reqwest::Client,
}

impl WebScrapeExecutor {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tundra/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self { client }
    }
}

#[async_trait]
impl CapabilityExecutor for WebScrapeExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::WebScrape
    }

    fn description(&self) -> &str {
        "Fetch a web page and extract its title, links and visible text"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        events: &mut EventLog,
    ) -> Result<Value, ExecutorError> {
        let url = require_str(&request.payload, "url")?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ExecutorError::InvalidPayload(format!(
                "url must be http or https: {url}"
            )));
        }

        events.status(format!("Fetching {url}"));
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExecutorError::Network(format!("GET {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Network(format!("GET {url} returned {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ExecutorError::Network(format!("reading body of {url}: {e}")))?;
        events.push(
            Event::new(EventKind::StatusUpdate, "Page fetched")
                .with_metadata("status", status.as_u16())
                .with_metadata("bytes", body.len()),
        );

        let page = extract_page(&body);
        events.message(match &page.title {
            Some(title) => format!("Extracted \"{title}\" with {} links", page.link_count),
            None => format!("Extracted untitled page with {} links", page.link_count),
        });

        let mut result = serde_json::to_value(&page)
            .map_err(|e| ExecutorError::MalformedOutput(e.to_string()))?;
        if let Some(obj) = result.as_object_mut() {
            obj.insert("url".into(), Value::String(url.to_string()));
            obj.insert("status".into(), Value::from(status.as_u16()));
        }
        Ok(result)
    }
}
