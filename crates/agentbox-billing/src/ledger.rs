use crate::{BillingClient, BillingError, Result};
use agentbox_common::Tier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct Account {
    pub user_id: String,
    pub tier: Tier,
    pub balance: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitRecord {
    pub user_id: String,
    pub tokens: u64,
    pub reason: String,
    pub at: DateTime<Utc>,
}

// In-memory ledger for development/testing
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    accounts: Arc<RwLock<HashMap<String, Account>>>,
    debits: Arc<RwLock<Vec<DebitRecord>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_account(&self, user_id: impl Into<String>, tier: Tier, balance: u64) {
        let user_id = user_id.into();
        self.accounts.write().await.insert(
            user_id.clone(),
            Account {
                user_id,
                tier,
                balance,
            },
        );
    }

    /// Adds tokens to a balance, e.g. after a confirmed purchase.
    pub async fn credit(&self, user_id: &str, tokens: u64) -> Result<u64> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(user_id)
            .ok_or_else(|| BillingError::AccountNotFound(user_id.to_string()))?;
        account.balance = account.balance.saturating_add(tokens);
        Ok(account.balance)
    }

    pub async fn debits(&self) -> Vec<DebitRecord> {
        self.debits.read().await.clone()
    }

    pub async fn debits_for(&self, user_id: &str) -> Vec<DebitRecord> {
        self.debits
            .read()
            .await
            .iter()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BillingClient for InMemoryLedger {
    async fn get_balance(&self, user_id: &str) -> Result<u64> {
        self.accounts
            .read()
            .await
            .get(user_id)
            .map(|a| a.balance)
            .ok_or_else(|| BillingError::AccountNotFound(user_id.to_string()))
    }

    async fn get_tier(&self, user_id: &str) -> Result<Tier> {
        self.accounts
            .read()
            .await
            .get(user_id)
            .map(|a| a.tier)
            .ok_or_else(|| BillingError::AccountNotFound(user_id.to_string()))
    }

    async fn debit(&self, user_id: &str, tokens: u64, reason: &str) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(user_id)
            .ok_or_else(|| BillingError::AccountNotFound(user_id.to_string()))?;

        if account.balance < tokens {
            return Err(BillingError::InsufficientBalance {
                required: tokens,
                available: account.balance,
            });
        }
        account.balance -= tokens;
        drop(accounts);

        self.debits.write().await.push(DebitRecord {
            user_id: user_id.to_string(),
            tokens,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_debit_never_overdraws() {
        let ledger = InMemoryLedger::new();
        ledger.create_account("alice", Tier::Team, 100).await;

        ledger.debit("alice", 60, "lease").await.unwrap();
        let err = ledger.debit("alice", 60, "lease").await.unwrap_err();
        assert_eq!(
            err,
            BillingError::InsufficientBalance {
                required: 60,
                available: 40
            }
        );
        assert_eq!(ledger.get_balance("alice").await.unwrap(), 40);
        assert_eq!(ledger.debits().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let ledger = InMemoryLedger::new();
        assert!(matches!(
            ledger.get_balance("nobody").await,
            Err(BillingError::AccountNotFound(_))
        ));
    }
}
