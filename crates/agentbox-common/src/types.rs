use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Account tiers, ordered from lowest to highest entitlement.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Developer,
    Team,
    Scale,
}

impl Tier {
    /// A tier satisfies a requirement when it is at least as high.
    pub fn satisfies(self, required: Tier) -> bool {
        self >= required
    }
}

/// Hard resource ceilings applied to a sandbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// Relative CPU weight (Docker cpu shares, 1024 = one full share).
    pub cpu_shares: u64,
    pub pid_limit: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_shares: 512,
            pid_limit: 256,
        }
    }
}

/// Mount point of the working volume when a template names none.
pub const DEFAULT_VOLUME_PATH: &str = "/workspace";

fn default_volume_path() -> String {
    DEFAULT_VOLUME_PATH.to_string()
}

fn default_active() -> bool {
    true
}

/// Catalog definition of an agent: image, limits and pricing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTemplate {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub image: String,
    /// Port the agent listens on inside the sandbox.
    pub port: u16,
    pub tokens_per_hour: u64,
    #[serde(default)]
    pub required_tier: Tier,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Whether leases of this agent get a terminal access secret.
    #[serde(default)]
    pub terminal_access: bool,
    /// Mount point of the persisted working volume.
    #[serde(default = "default_volume_path")]
    pub volume_path: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl AgentTemplate {
    /// Tokens required to lease this agent for `hours`.
    pub fn lease_cost(&self, hours: u32) -> u64 {
        self.tokens_per_hour.saturating_mul(u64::from(hours))
    }
}

/// Opaque, stable identifier of one sandbox lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Expired,
    Error,
}

impl InstanceStatus {
    pub const ACTIVE: [InstanceStatus; 3] = [
        InstanceStatus::Provisioning,
        InstanceStatus::Running,
        InstanceStatus::Stopping,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Stopped | InstanceStatus::Expired | InstanceStatus::Error
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine.
    ///
    /// RUNNING and STOPPING may also "transition" to themselves; those are
    /// field-only updates guarded by the same compare-and-swap.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Provisioning, Running)
                | (Provisioning, Error)
                | (Running, Running)
                | (Running, Stopping)
                | (Running, Expired)
                | (Stopping, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Expired)
                | (Stopping, Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Provisioning => "PROVISIONING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Stopping => "STOPPING",
            InstanceStatus::Stopped => "STOPPED",
            InstanceStatus::Expired => "EXPIRED",
            InstanceStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance is due for reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimReason {
    /// Wall-clock lease end reached.
    Expired,
    /// Billing refused further consumption.
    EntitlementExhausted,
    UserStop,
    /// Teardown of a previous owner never finished.
    Stale,
}

impl ReclaimReason {
    /// Terminal status recorded once reclamation completes.
    pub fn terminal_status(self) -> InstanceStatus {
        match self {
            ReclaimReason::Expired | ReclaimReason::EntitlementExhausted => {
                InstanceStatus::Expired
            }
            ReclaimReason::UserStop | ReclaimReason::Stale => InstanceStatus::Stopped,
        }
    }
}

/// One-time terminal access secret. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessSecret(String);

impl AccessSecret {
    pub fn new(secret: String) -> Self {
        Self(secret)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessSecret(<redacted>)")
    }
}

/// Registry record of one sandbox lease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerInstance {
    pub id: InstanceId,
    pub user_id: String,
    pub template_id: String,
    pub runtime_handle: Option<String>,
    pub subdomain: String,
    pub status: InstanceStatus,
    pub access_secret: Option<AccessSecret>,
    pub tokens_consumed: u64,
    pub tokens_debited: u64,
    pub last_metered_at: DateTime<Utc>,
    pub reclaim: Option<ReclaimReason>,
    pub last_error: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by every registry transition.
    pub version: u64,
}

impl ContainerInstance {
    /// Builds a PROVISIONING record with no runtime handle yet.
    pub fn pending(
        user_id: impl Into<String>,
        template_id: impl Into<String>,
        subdomain: impl Into<String>,
        access_secret: Option<AccessSecret>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: InstanceId::new(),
            user_id: user_id.into(),
            template_id: template_id.into(),
            runtime_handle: None,
            subdomain: subdomain.into(),
            status: InstanceStatus::Provisioning,
            access_secret,
            tokens_consumed: 0,
            tokens_debited: 0,
            last_metered_at: now,
            reclaim: None,
            last_error: None,
            expires_at,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.reclaim.is_some() || self.expires_at <= now
    }
}

/// Storage key of the live snapshot for a (user, template) pair.
pub fn snapshot_key(user_id: &str, template_id: &str) -> String {
    format!("snapshots/{user_id}/{template_id}.tar.zst")
}

/// Metadata of the live snapshot for a (user, template) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageVolume {
    pub user_id: String,
    pub template_id: String,
    pub storage_key: String,
    /// Uncompressed archive size.
    pub size_bytes: u64,
    pub sha256: String,
    pub last_sync_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionResult {
    pub instance_id: InstanceId,
    pub url: String,
    pub access_secret: Option<AccessSecret>,
    pub expires_at: DateTime<Utc>,
}

/// Status shown to users. Internal failures are reported as `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayStatus {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Expired,
}

impl From<InstanceStatus> for DisplayStatus {
    fn from(status: InstanceStatus) -> Self {
        match status {
            InstanceStatus::Provisioning => DisplayStatus::Provisioning,
            InstanceStatus::Running => DisplayStatus::Running,
            InstanceStatus::Stopping => DisplayStatus::Stopping,
            InstanceStatus::Stopped | InstanceStatus::Error => DisplayStatus::Stopped,
            InstanceStatus::Expired => DisplayStatus::Expired,
        }
    }
}

/// User-facing view of an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerInfo {
    pub id: InstanceId,
    pub template_id: String,
    pub url: String,
    pub status: DisplayStatus,
    pub tokens_consumed: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ContainerInfo {
    pub fn from_instance(instance: &ContainerInstance, public_domain: &str) -> Self {
        Self {
            id: instance.id,
            template_id: instance.template_id.clone(),
            url: instance_url(&instance.subdomain, public_domain),
            status: instance.status.into(),
            tokens_consumed: instance.tokens_consumed,
            created_at: instance.created_at,
            expires_at: instance.expires_at,
        }
    }
}

pub fn instance_url(subdomain: &str, public_domain: &str) -> String {
    format!("https://{subdomain}.{public_domain}")
}
