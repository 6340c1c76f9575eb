//! Lexicon-based sentiment scoring.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ExecutorError;
use crate::executor::event::EventLog;
use crate::executor::{CapabilityExecutor, ExecutionRequest, require_str};
use crate::market::model::TaskType;

/// Scores within this distance of zero are neutral.
const NEUTRAL_BAND: f64 = 0.1;

static POSITIVE: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "good", "great", "excellent", "amazing", "awesome", "love", "loved", "like", "liked",
        "happy", "fantastic", "wonderful", "best", "nice", "pleased", "positive", "fast",
        "reliable", "helpful", "recommend", "enjoy", "enjoyed", "perfect", "impressive",
    ])
});

static NEGATIVE: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "bad", "terrible", "awful", "horrible", "hate", "hated", "dislike", "poor", "worst",
        "sad", "angry", "slow", "broken", "buggy", "negative", "disappointed", "disappointing",
        "useless", "annoying", "fail", "failed", "crash", "crashed", "expensive",
    ])
});

static NEGATORS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from(["not", "no", "never", "isn't", "wasn't", "don't", "doesn't", "didn't"])
});

/// Lexicon score for `text`: hit counts and a score in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentimentScore {
    pub positive_hits: usize,
    pub negative_hits: usize,
    pub words: usize,
    pub score: f64,
}

impl SentimentScore {
    pub fn label(&self) -> &'static str {
        if self.score > NEUTRAL_BAND {
            "positive"
        } else if self.score < -NEUTRAL_BAND {
            "negative"
        } else {
            "neutral"
        }
    }
}

/// Score `text` against the built-in lexicon. A negator flips the polarity
/// of the word that follows it.
pub fn score_text(text: &str) -> SentimentScore {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .collect();

    let mut positive_hits = 0;
    let mut negative_hits = 0;
    let mut negate = false;
    for word in &words {
        if NEGATORS.contains(word) {
            negate = true;
            continue;
        }
        let polarity = if POSITIVE.contains(word) {
            1
        } else if NEGATIVE.contains(word) {
            -1
        } else {
            0
        };
        match (polarity, negate) {
            (1, false) | (-1, true) => positive_hits += 1,
            (-1, false) | (1, true) => negative_hits += 1,
            _ => {}
        }
        negate = false;
    }

    let hits = positive_hits + negative_hits;
    let score = if hits == 0 {
        0.0
    } else {
        (positive_hits as f64 - negative_hits as f64) / hits as f64
    };

    SentimentScore {
        positive_hits,
        negative_hits,
        words: words.len(),
        score,
    }
}

#[derive(Debug)]
pub struct SentimentExecutor;

#[async_trait]
impl CapabilityExecutor for SentimentExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::SentimentAnalysis
    }

    fn description(&self) -> &str {
        "Classify the sentiment of a text as positive, negative or neutral"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        events: &mut EventLog,
    ) -> Result<Value, ExecutorError> {
        let text = require_str(&request.payload, "text")?;
        let scored = score_text(text);
        events.status(format!(
            "Scored {} words: {} positive, {} negative",
            scored.words, scored.positive_hits, scored.negative_hits
        ));

        Ok(json!({
            "sentiment": scored.label(),
            "score": (scored.score * 1000.0).round() / 1000.0,
            "details": {
                "positive_hits": scored.positive_hits,
                "negative_hits": scored.negative_hits,
                "words": scored.words,
            },
        }))
    }
}
