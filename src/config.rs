//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::error::ConfigError;

/// Upper bound on any single page of job listings.
pub const MAX_PAGE_LIMIT: u32 = 500;

/// Marketplace configuration, read from `TUNDRA_*` environment variables.
#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Fixed backoff a provider loop sleeps after finding no eligible job.
    pub poll_interval: Duration,
    /// Upper bound of random jitter added to each backoff.
    pub poll_jitter: Duration,
    /// HTTP port for the API.
    pub api_port: u16,
    /// Whether the marketplace accepts submissions.
    pub enabled: bool,
    /// Default page size for job listings.
    pub page_limit: u32,
    /// Per-execution timeout enforced by the execution adapter.
    pub executor_timeout: Duration,
    /// Jobs stuck in `claimed`/`in_progress` longer than this are failed.
    /// `None` disables the sweep.
    pub stale_after: Option<Duration>,
    /// Upsert the built-in provider table at startup.
    pub seed_providers: bool,
    /// Credits granted to a requester the first time they submit.
    pub starting_balance: Decimal,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/tundra.db"),
            poll_interval: Duration::from_millis(1000),
            poll_jitter: Duration::from_millis(250),
            api_port: 8000,
            enabled: true,
            page_limit: 50,
            executor_timeout: Duration::from_secs(60),
            stale_after: None,
            seed_providers: true,
            starting_balance: Decimal::ZERO,
        }
    }
}

impl MarketConfig {
    /// Build configuration from the environment. Unset variables fall back
    /// to defaults; set but unparseable ones are rejected.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let env = Env { lookup: &lookup };

        let db_path = env
            .raw("TUNDRA_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let poll_interval = env
            .parse::<u64>("TUNDRA_POLL_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let poll_jitter = env
            .parse::<u64>("TUNDRA_POLL_JITTER_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_jitter);

        let api_port = env.parse::<u16>("TUNDRA_API_PORT")?.unwrap_or(defaults.api_port);

        let enabled = env.flag("TUNDRA_MARKETPLACE_ENABLED")?.unwrap_or(defaults.enabled);

        let page_limit = env.parse::<u32>("TUNDRA_PAGE_LIMIT")?.unwrap_or(defaults.page_limit);
        if !(1..=MAX_PAGE_LIMIT).contains(&page_limit) {
            return Err(ConfigError::InvalidValue {
                key: "TUNDRA_PAGE_LIMIT".to_string(),
                message: format!("must be between 1 and {MAX_PAGE_LIMIT}, got {page_limit}"),
            });
        }

        let executor_timeout = env
            .parse::<u64>("TUNDRA_EXECUTOR_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.executor_timeout);

        // 0 disables the sweep, same as leaving it unset.
        let stale_after = env
            .parse::<u64>("TUNDRA_STALE_AFTER_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let seed_providers = env.flag("TUNDRA_SEED_PROVIDERS")?.unwrap_or(defaults.seed_providers);

        let starting_balance = env
            .parse::<Decimal>("TUNDRA_STARTING_BALANCE")?
            .unwrap_or(defaults.starting_balance);
        if starting_balance.is_sign_negative() {
            return Err(ConfigError::InvalidValue {
                key: "TUNDRA_STARTING_BALANCE".to_string(),
                message: format!("must not be negative, got {starting_balance}"),
            });
        }

        Ok(Self {
            db_path,
            poll_interval,
            poll_jitter,
            api_port,
            enabled,
            page_limit,
            executor_timeout,
            stale_after,
            seed_providers,
            starting_balance,
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Trimmed value, `None` when unset or blank.
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.raw(key)
            .map(|v| {
                v.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{v}': {e}"),
                })
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.raw(key)
            .map(|v| {
                parse_bool(&v).ok_or_else(|| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("expected a boolean, got '{v}'"),
                })
            })
            .transpose()
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
