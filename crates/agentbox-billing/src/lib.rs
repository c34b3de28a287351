// Billing collaborator clients: balance reads and debit requests
use agentbox_common::{LeaseError, Tier};
use async_trait::async_trait;
use thiserror::Error;

mod http;
mod ledger;

pub use http::HttpBillingClient;
pub use ledger::{Account, DebitRecord, InMemoryLedger};

// Error Types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    #[error("Insufficient balance: {required} required, {available} available")]
    InsufficientBalance { required: u64, available: u64 },
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error("Billing service unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid billing response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, BillingError>;

impl From<BillingError> for LeaseError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientBalance {
                required,
                available,
            } => LeaseError::InsufficientBalance {
                required,
                available,
            },
            BillingError::AccountNotFound(user) => {
                LeaseError::NotFound(format!("billing account {user}"))
            }
            other => LeaseError::Billing(other.to_string()),
        }
    }
}

/// The external token balance owner.
///
/// The lease manager never assumes exclusive access to a balance: it may change
/// between a read and a debit, so `debit` is the only authoritative check.
#[async_trait]
pub trait BillingClient: Send + Sync {
    async fn get_balance(&self, user_id: &str) -> Result<u64>;
    async fn get_tier(&self, user_id: &str) -> Result<Tier>;
    async fn debit(&self, user_id: &str, tokens: u64, reason: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_balance_maps_to_lease_error() {
        let err: LeaseError = BillingError::InsufficientBalance {
            required: 120,
            available: 20,
        }
        .into();
        assert_eq!(
            err,
            LeaseError::InsufficientBalance {
                required: 120,
                available: 20
            }
        );
    }

    #[test]
    fn test_transport_failure_maps_to_billing_error() {
        let err: LeaseError = BillingError::Unavailable("connection refused".into()).into();
        assert_eq!(err.code(), "billing_error");
    }
}
