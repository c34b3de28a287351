//! Agent container lease manager.
//!
//! Provisions resource-bounded sandboxes for (user, agent template) pairs,
//! meters their token entitlement, and reclaims them on expiry with a volume
//! snapshot that the next lease of the same pair restores.
//!
//! All coordination goes through compare-and-swap transitions on the
//! [`registry::InstanceRegistry`]; no component holds a registry lock across a
//! runtime call.

pub mod config;
pub mod manager;
pub mod meter;
pub mod provisioner;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod snapshot;

// Re-export dependencies potentially needed by consumers (like the server)
pub use agentbox_billing as billing;
pub use agentbox_common as common;
pub use bollard;

pub use config::{BillingMode, ConfigError, ManagerConfig, RetryPolicy, TemplateCatalog};
pub use manager::{BackgroundTasks, DownloadLink, LeaseManager};
pub use meter::{MeterReport, UsageMeter};
pub use provisioner::Provisioner;
pub use reaper::{ReapReport, Reaper, ReclaimOutcome};
pub use registry::{CreateLimits, Expect, InstanceRegistry, MemoryRegistry, RegistryError};
pub use runtime::{
    ContainerRuntime, DockerRuntime, LaunchSpec, MemoryRuntime, RuntimeError, RuntimeFaults,
    RuntimeState,
};
pub use snapshot::{ObjectSnapshotStore, SnapshotPut, SnapshotStore, StoreError};
