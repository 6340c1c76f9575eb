//! Capability registry: providers with their capabilities and rates.
//!
//! The registry is read-mostly and administered outside the engine. Intake
//! reads it once per submission to freeze a job's eligibility snapshot;
//! later registry edits never touch existing jobs.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, RegistryError};
use crate::market::model::{TaskType, timestamp};
use crate::store::Database;

/// Availability of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Idle,
    Disabled,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "idle" => Self::Idle,
            _ => Self::Disabled,
        }
    }
}

/// A capability provider: identity, capability set and quoted rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<TaskType>,
    /// Credits charged per task.
    pub rate: Decimal,
    pub region: String,
    pub status: ProviderStatus,
    pub updated_at: DateTime<Utc>,
}

impl Provider {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        capabilities: Vec<TaskType>,
        rate: Decimal,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities,
            rate,
            region: "global".to_string(),
            status: ProviderStatus::Active,
            updated_at: timestamp(),
        }
    }

    /// Builder: set region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Builder: set status.
    pub fn with_status(mut self, status: ProviderStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ProviderStatus::Active
    }

    /// Whether this provider can take a job of `task_type` paying `budget`.
    pub fn can_service(&self, task_type: TaskType, budget: Decimal) -> bool {
        self.is_active() && self.capabilities.contains(&task_type) && self.rate <= budget
    }
}

/// Providers eligible for a job, sorted by identity.
pub fn eligible(providers: &[Provider], task_type: TaskType, budget: Decimal) -> Vec<String> {
    let mut ids: Vec<String> = providers
        .iter()
        .filter(|p| p.can_service(task_type, budget))
        .map(|p| p.id.clone())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Built-in provider table loaded at daemon start.
pub fn seed_providers() -> Vec<Provider> {
    vec![
        Provider::new("A1", "WebScraperAgent", vec![TaskType::WebScrape], dec!(15))
            .with_region("US-East"),
        Provider::new(
            "A2",
            "SummarizeGPT",
            vec![TaskType::Summarize, TaskType::SentimentAnalysis],
            dec!(8),
        )
        .with_region("EU-West"),
        Provider::new("A3", "ValidatorPro", vec![TaskType::Generic], dec!(12))
            .with_region("US-West"),
        Provider::new(
            "A4",
            "InsightMiner",
            vec![TaskType::SentimentAnalysis, TaskType::Summarize],
            dec!(18),
        )
        .with_region("US-East"),
        Provider::new("A5", "ImageAnalyzerPro", vec![TaskType::Generic], dec!(18))
            .with_region("Asia-Pacific")
            .with_status(ProviderStatus::Idle),
    ]
}

/// Upsert the built-in providers. Returns how many were written.
pub async fn seed(db: &Arc<dyn Database>) -> Result<usize, DatabaseError> {
    let providers = seed_providers();
    for provider in &providers {
        db.upsert_provider(provider).await?;
    }
    tracing::info!(count = providers.len(), "Seeded provider registry");
    Ok(providers.len())
}

/// A provider as submitted by an operator. Upserts by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRegistration {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub rate: Decimal,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub status: Option<ProviderStatus>,
}

impl ProviderRegistration {
    /// Validate into a `Provider`. Capabilities accept the task type
    /// aliases and are deduplicated in declaration order.
    pub fn into_provider(self) -> Result<Provider, RegistryError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(RegistryError::EmptyId);
        }
        let name = self.name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.rate <= Decimal::ZERO {
            return Err(RegistryError::InvalidRate(self.rate.to_string()));
        }

        let mut capabilities = Vec::new();
        for raw in &self.capabilities {
            let task_type = TaskType::from_str(raw.trim()).map_err(RegistryError::UnknownCapability)?;
            if !capabilities.contains(&task_type) {
                capabilities.push(task_type);
            }
        }
        if capabilities.is_empty() {
            return Err(RegistryError::NoCapabilities);
        }

        let mut provider = Provider::new(id, name, capabilities, self.rate);
        if let Some(region) = self.region.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            provider = provider.with_region(region);
        }
        if let Some(status) = self.status {
            provider = provider.with_status(status);
        }
        Ok(provider)
    }
}

/// Validate and upsert a provider. Existing jobs keep their eligibility
/// snapshot; only later submissions see the change.
pub async fn register(
    db: &dyn Database,
    registration: ProviderRegistration,
) -> Result<Provider, RegistryError> {
    let provider = registration.into_provider()?;
    db.upsert_provider(&provider).await?;
    tracing::info!(
        provider = %provider.id,
        rate = %provider.rate,
        status = provider.status.as_str(),
        "Provider registered"
    );
    Ok(provider)
}
