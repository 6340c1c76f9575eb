//! Read-only per-provider aggregates over job history.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::registry::ProviderStatus;
use crate::store::{Database, ProviderTally};

/// Competition stats for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderScore {
    pub provider_id: String,
    /// `None` for identities that appear in job history but not the registry.
    pub name: Option<String>,
    pub rate: Option<Decimal>,
    pub status: Option<ProviderStatus>,
    pub eligible_count: u64,
    pub claimed_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    /// `claimed / eligible`, 0 when never eligible.
    pub win_rate: f64,
    /// `eligible - claimed`.
    pub missed: u64,
}

impl ProviderScore {
    fn from_tally(tally: &ProviderTally) -> Self {
        let win_rate = if tally.eligible_count == 0 {
            0.0
        } else {
            tally.claimed_count as f64 / tally.eligible_count as f64
        };
        Self {
            provider_id: tally.provider_id.clone(),
            name: None,
            rate: None,
            status: None,
            eligible_count: tally.eligible_count,
            claimed_count: tally.claimed_count,
            completed_count: tally.completed_count,
            failed_count: tally.failed_count,
            win_rate,
            missed: tally.eligible_count.saturating_sub(tally.claimed_count),
        }
    }
}

/// Stats for every registered provider plus any identity seen in job
/// history, ordered by provider identity.
pub async fn scoreboard(db: &dyn Database) -> Result<Vec<ProviderScore>, DatabaseError> {
    let mut scores: BTreeMap<String, ProviderScore> = BTreeMap::new();

    for tally in db.provider_tallies().await? {
        scores.insert(tally.provider_id.clone(), ProviderScore::from_tally(&tally));
    }

    for provider in db.list_providers().await? {
        let score = scores.entry(provider.id.clone()).or_insert_with(|| {
            ProviderScore::from_tally(&ProviderTally {
                provider_id: provider.id.clone(),
                ..Default::default()
            })
        });
        score.name = Some(provider.name);
        score.rate = Some(provider.rate);
        score.status = Some(provider.status);
    }

    Ok(scores.into_values().collect())
}
