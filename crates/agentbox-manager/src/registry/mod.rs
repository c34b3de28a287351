//! Durable record of every lease and its live snapshot.
//!
//! The registry is the single source of truth for instance state. Every
//! status change goes through [`InstanceRegistry::transition`], a
//! compare-and-swap guarded by the expected status (and optionally the
//! record version), so concurrent provisioners, meters and reapers can never
//! both win the same edge.

mod memory;

pub use memory::MemoryRegistry;

use agentbox_common::{
    ContainerInstance, InstanceId, InstanceStatus, LeaseError, StorageVolume,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("instance {0} not found")]
    NotFound(InstanceId),

    #[error("instance {id} is {actual} (version {version}), expected {expected}")]
    Conflict {
        id: InstanceId,
        expected: String,
        actual: InstanceStatus,
        version: u64,
    },

    #[error("illegal transition {from} -> {to} for instance {id}")]
    IllegalTransition {
        id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("user {user_id} already has an active lease of {template_id}")]
    ActiveLeaseExists { user_id: String, template_id: String },

    #[error("subdomain {0} is already in use")]
    SubdomainTaken(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl From<RegistryError> for LeaseError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => LeaseError::NotFound(format!("instance {id}")),
            RegistryError::ActiveLeaseExists {
                user_id,
                template_id,
            } => LeaseError::AlreadyProvisioned {
                user_id,
                template_id,
            },
            RegistryError::CapacityExceeded(msg) => LeaseError::CapacityExceeded(msg),
            e @ RegistryError::Conflict { .. } => LeaseError::Conflict(e.to_string()),
            e => LeaseError::Internal(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Guard of a compare-and-swap transition.
#[derive(Debug, Clone)]
pub struct Expect {
    pub statuses: Vec<InstanceStatus>,
    /// When set, the record must also still be at this version.
    pub version: Option<u64>,
}

impl Expect {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            statuses: vec![status],
            version: None,
        }
    }

    /// Matches only the exact record that was read.
    pub fn exact(instance: &ContainerInstance) -> Self {
        Self {
            statuses: vec![instance.status],
            version: Some(instance.version),
        }
    }

    fn matches(&self, instance: &ContainerInstance) -> bool {
        self.statuses.contains(&instance.status)
            && self.version.map_or(true, |v| v == instance.version)
    }

    fn describe(&self) -> String {
        let statuses: Vec<_> = self.statuses.iter().map(|s| s.as_str()).collect();
        match self.version {
            Some(v) => format!("{} at version {v}", statuses.join("|")),
            None => statuses.join("|"),
        }
    }
}

/// Field changes applied atomically with a transition.
pub type Mutation = Box<dyn FnOnce(&mut ContainerInstance) + Send>;

/// Mutation that changes nothing besides the status.
pub fn no_change() -> Mutation {
    Box::new(|_| {})
}

/// Admission limits checked atomically with the insert.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateLimits {
    pub max_active_total: Option<usize>,
    pub max_active_per_user: Option<usize>,
}

#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Inserts a PROVISIONING record unless the pair already has an active
    /// lease, the subdomain is taken, or a limit would be exceeded.
    async fn create(&self, instance: ContainerInstance, limits: CreateLimits)
        -> Result<ContainerInstance>;

    /// Moves `id` to `to` if it currently matches `expect`, applying `mutate`
    /// in the same step. Returns the updated record.
    async fn transition(
        &self,
        id: InstanceId,
        expect: Expect,
        to: InstanceStatus,
        mutate: Mutation,
    ) -> Result<ContainerInstance>;

    async fn find(&self, id: InstanceId) -> Result<Option<ContainerInstance>>;

    async fn find_active(
        &self,
        user_id: &str,
        template_id: &str,
    ) -> Result<Option<ContainerInstance>>;

    /// All instances of a user, newest first.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<ContainerInstance>>;

    async fn list_running(&self) -> Result<Vec<ContainerInstance>>;

    /// RUNNING instances that are expired or flagged, plus STOPPING instances
    /// whose teardown has not moved for `stopping_stale_after`.
    async fn list_reclaimable(
        &self,
        now: DateTime<Utc>,
        stopping_stale_after: Duration,
    ) -> Result<Vec<ContainerInstance>>;

    /// PROVISIONING instances older than `stale_after`.
    async fn list_stale_provisioning(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<ContainerInstance>>;

    /// Active instances overall or for one user.
    async fn count_active(&self, user_id: Option<&str>) -> Result<usize>;

    async fn find_volume(
        &self,
        user_id: &str,
        template_id: &str,
    ) -> Result<Option<StorageVolume>>;

    async fn upsert_volume(&self, volume: StorageVolume) -> Result<()>;
}
