// Re-export dependencies used in public interfaces of common types

pub use chrono;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

mod types;

pub use types::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Agent {template_id} is already provisioned for user {user_id}")]
    AlreadyProvisioned { user_id: String, template_id: String },

    #[error("Insufficient balance: {required} tokens required, {available} available")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("Capacity Exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Runtime Error: {0}")]
    Runtime(String),

    #[error("Snapshot Store Error: {0}")]
    Store(String),

    #[error("Billing Error: {0}")]
    Billing(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl LeaseError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            LeaseError::Validation(_) => "validation_error",
            LeaseError::AlreadyProvisioned { .. } => "already_provisioned",
            LeaseError::InsufficientBalance { .. } => "insufficient_balance",
            LeaseError::CapacityExceeded(_) => "capacity_exceeded",
            LeaseError::Conflict(_) => "conflict",
            LeaseError::NotFound(_) => "not_found",
            LeaseError::Runtime(_) => "runtime_error",
            LeaseError::Store(_) => "store_error",
            LeaseError::Billing(_) => "billing_error",
            LeaseError::Internal(_) => "internal_error",
        }
    }
}

// Define the primary Result type for lease operations
pub type Result<T> = std::result::Result<T, LeaseError>;
