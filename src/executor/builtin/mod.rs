//! Built-in executors: web scraping, summarization, sentiment analysis and a
//! generic acknowledger.

mod generic;
mod sentiment;
mod summarize;
mod web_scrape;

pub use generic::GenericExecutor;
pub use sentiment::{SentimentExecutor, score_text};
pub use summarize::{SummarizeExecutor, split_sentences};
pub use web_scrape::{PageSummary, WebScrapeExecutor, extract_page};
