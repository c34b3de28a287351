//! Sandbox runtime abstraction.
//!
//! A runtime creates resource-bounded sandboxes with one persisted working
//! volume, stops them, and exports that volume as a tar archive. Runtime
//! handles are opaque strings owned by the runtime.

mod docker;
mod memory;

pub use docker::DockerRuntime;
pub use memory::{MemoryRuntime, RuntimeFaults};

use crate::retry::{Retryable, StepTimeout};
use agentbox_common::{LeaseError, ResourceLimits};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("sandbox {0} not found")]
    NotFound(String),

    #[error("runtime call timed out after {0:?}")]
    Timeout(Duration),

    #[error("runtime API error: {0}")]
    Api(String),

    #[error("runtime error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

impl Retryable for RuntimeError {
    fn is_retryable(&self) -> bool {
        !self.is_not_found()
    }
}

impl From<StepTimeout> for RuntimeError {
    fn from(timeout: StepTimeout) -> Self {
        RuntimeError::Timeout(timeout.0)
    }
}

impl From<RuntimeError> for LeaseError {
    fn from(err: RuntimeError) -> Self {
        LeaseError::Runtime(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything the runtime needs to start one sandbox.
#[derive(Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub limits: ResourceLimits,
    pub env: HashMap<String, String>,
    pub port: u16,
    /// Mount point of the working volume inside the sandbox.
    pub volume_path: String,
    pub labels: HashMap<String, String>,
    /// Tar archive unpacked into the volume before the sandbox starts.
    pub restore_from: Option<Bytes>,
}

// Env carries the access secret, so only the keys are printed.
impl fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut env_keys: Vec<_> = self.env.keys().collect();
        env_keys.sort();
        f.debug_struct("LaunchSpec")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("limits", &self.limits)
            .field("env_keys", &env_keys)
            .field("port", &self.port)
            .field("volume_path", &self.volume_path)
            .field("labels", &self.labels)
            .field("restore_bytes", &self.restore_from.as_ref().map(|b| b.len()))
            .finish()
    }
}

/// Observed state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Running,
    Exited,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates and starts a sandbox, returning its handle. Nothing is left
    /// behind when this fails.
    async fn create_and_start(&self, spec: &LaunchSpec) -> Result<String>;

    /// Graceful stop within `grace`, after which the runtime may kill.
    async fn stop(&self, handle: &str, grace: Duration) -> Result<()>;

    async fn kill(&self, handle: &str) -> Result<()>;

    /// Removes the sandbox and its anonymous volume. Removing a sandbox that
    /// no longer exists succeeds.
    async fn remove(&self, handle: &str) -> Result<()>;

    /// `None` when the sandbox no longer exists.
    async fn inspect(&self, handle: &str) -> Result<Option<RuntimeState>>;

    /// Tar archive of the working volume. Works on stopped sandboxes.
    async fn export_volume(&self, handle: &str, volume_path: &str) -> Result<Bytes>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_spec_debug_hides_env_values() {
        let spec = LaunchSpec {
            name: "agentbox-1".into(),
            image: "busybox".into(),
            limits: ResourceLimits::default(),
            env: HashMap::from([("AGENTBOX_ACCESS_SECRET".to_string(), "hunter2".to_string())]),
            port: 8080,
            volume_path: "/workspace".into(),
            labels: HashMap::new(),
            restore_from: None,
        };
        let debug = format!("{spec:?}");
        assert!(debug.contains("AGENTBOX_ACCESS_SECRET"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_not_found_is_not_retried() {
        assert!(!RuntimeError::NotFound("x".into()).is_retryable());
        assert!(RuntimeError::Api("503".into()).is_retryable());
        assert!(RuntimeError::Timeout(Duration::from_secs(1)).is_retryable());
    }
}
