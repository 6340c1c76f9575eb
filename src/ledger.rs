//! Credit ledger. Per-identity balances, mutated only by settlement and deposits.
//!
//! Every completed job moves exactly its budget from the requester to the
//! provider, so the sum of all balances only changes through deposits.
//! There is no hold at claim time: a requester can be driven negative when
//! several of their jobs settle before a top-up.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::store::Database;

/// A zero-sum movement of credits tied to one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub job_id: Uuid,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
}

impl Transfer {
    pub fn new(job_id: Uuid, from: impl Into<String>, to: impl Into<String>, amount: Decimal) -> Self {
        Self {
            job_id,
            from: from.into(),
            to: to.into(),
            amount,
        }
    }
}

/// A persisted transfer, as recorded at settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub job_id: Uuid,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Balance of one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub identity: String,
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Account view returned to API clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStatement {
    pub identity: String,
    pub balance: Decimal,
    pub transfers: Vec<TransferRecord>,
}

/// Thin validation layer over the ledger half of the store.
#[derive(Clone)]
pub struct Ledger {
    db: Arc<dyn Database>,
}

impl Ledger {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Current balance; unknown identities have zero.
    pub async fn balance(&self, identity: &str) -> Result<Decimal, LedgerError> {
        Ok(self.db.balance(identity).await?)
    }

    /// Top up an account. Returns the new balance.
    pub async fn deposit(&self, identity: &str, amount: Decimal) -> Result<Decimal, LedgerError> {
        if identity.trim().is_empty() {
            return Err(LedgerError::EmptyIdentity);
        }
        if amount <= Decimal::ZERO {
            return Err(LedgerError::NonPositiveAmount(amount.to_string()));
        }
        let balance = self.db.deposit(identity, amount).await?;
        tracing::info!(identity = %identity, amount = %amount, balance = %balance, "Deposit applied");
        Ok(balance)
    }

    /// Every account, ordered by identity.
    pub async fn balances(&self) -> Result<Vec<Account>, LedgerError> {
        Ok(self.db.list_accounts().await?)
    }

    /// Sum of every balance in the system.
    pub async fn total(&self) -> Result<Decimal, LedgerError> {
        Ok(self.balances().await?.iter().map(|a| a.balance).sum())
    }

    /// Transfers touching `identity` on either side, oldest first.
    pub async fn transfers_for(&self, identity: &str) -> Result<Vec<TransferRecord>, LedgerError> {
        Ok(self.db.transfers_for(identity).await?)
    }

    /// Balance plus every transfer touching `identity`, oldest first.
    pub async fn statement(&self, identity: &str) -> Result<AccountStatement, LedgerError> {
        let balance = self.db.balance(identity).await?;
        let transfers = self.transfers_for(identity).await?;
        Ok(AccountStatement {
            identity: identity.to_string(),
            balance,
            transfers,
        })
    }
}
