use super::{ContainerRuntime, LaunchSpec, Result, RuntimeError, RuntimeState};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct Sandbox {
    spec: LaunchSpec,
    state: RuntimeState,
    volume: Bytes,
}

/// Failures to inject into the next calls.
#[derive(Debug, Clone, Default)]
pub struct RuntimeFaults {
    /// Number of upcoming `create_and_start` calls that fail.
    pub fail_creates: u32,
    /// Number of upcoming `stop` calls that fail.
    pub fail_stops: u32,
    /// `stop` never returns.
    pub hang_stop: bool,
    /// Number of upcoming `export_volume` calls that fail.
    pub fail_exports: u32,
}

#[derive(Default)]
struct Inner {
    sandboxes: HashMap<String, Sandbox>,
    faults: RuntimeFaults,
    launched: Vec<LaunchSpec>,
}

/// Runtime that keeps sandboxes in process. The volume of each sandbox is an
/// opaque byte blob, exported and restored verbatim.
#[derive(Clone, Default)]
pub struct MemoryRuntime {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
    creates: Arc<AtomicU32>,
    removes: Arc<AtomicU32>,
}

// Never held across an await.
fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_faults(&self, faults: RuntimeFaults) {
        lock(&self.inner).faults = faults;
    }

    /// Replaces the volume contents, as if the agent wrote to it.
    pub fn write_volume(&self, handle: &str, data: impl Into<Bytes>) -> Result<()> {
        let mut inner = lock(&self.inner);
        let sandbox = inner
            .sandboxes
            .get_mut(handle)
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))?;
        sandbox.volume = data.into();
        Ok(())
    }

    pub fn volume(&self, handle: &str) -> Option<Bytes> {
        lock(&self.inner).sandboxes.get(handle).map(|s| s.volume.clone())
    }

    /// Simulates a sandbox removed behind the manager's back.
    pub fn delete_externally(&self, handle: &str) -> bool {
        lock(&self.inner).sandboxes.remove(handle).is_some()
    }

    pub fn state(&self, handle: &str) -> Option<RuntimeState> {
        lock(&self.inner).sandboxes.get(handle).map(|s| s.state)
    }

    pub fn live_count(&self) -> usize {
        lock(&self.inner).sandboxes.len()
    }

    pub fn create_count(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> u32 {
        self.removes.load(Ordering::SeqCst)
    }

    /// Every spec passed to a successful `create_and_start`.
    pub fn launched(&self) -> Vec<LaunchSpec> {
        lock(&self.inner).launched.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create_and_start(&self, spec: &LaunchSpec) -> Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut inner = lock(&self.inner);
        if inner.faults.fail_creates > 0 {
            inner.faults.fail_creates -= 1;
            return Err(RuntimeError::Api("injected create failure".into()));
        }

        let handle = format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        inner.sandboxes.insert(
            handle.clone(),
            Sandbox {
                spec: spec.clone(),
                state: RuntimeState::Running,
                volume: spec.restore_from.clone().unwrap_or_default(),
            },
        );
        inner.launched.push(spec.clone());
        debug!(handle = %handle, name = %spec.name, "sandbox created");
        Ok(handle)
    }

    async fn stop(&self, handle: &str, _grace: Duration) -> Result<()> {
        let hang = {
            let mut inner = lock(&self.inner);
            if inner.faults.fail_stops > 0 {
                inner.faults.fail_stops -= 1;
                return Err(RuntimeError::Api("injected stop failure".into()));
            }
            inner.faults.hang_stop
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut inner = lock(&self.inner);
        let sandbox = inner
            .sandboxes
            .get_mut(handle)
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))?;
        sandbox.state = RuntimeState::Exited;
        Ok(())
    }

    async fn kill(&self, handle: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        let sandbox = inner
            .sandboxes
            .get_mut(handle)
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))?;
        sandbox.state = RuntimeState::Exited;
        Ok(())
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner).sandboxes.remove(handle);
        Ok(())
    }

    async fn inspect(&self, handle: &str) -> Result<Option<RuntimeState>> {
        Ok(self.state(handle))
    }

    async fn export_volume(&self, handle: &str, volume_path: &str) -> Result<Bytes> {
        let mut inner = lock(&self.inner);
        if inner.faults.fail_exports > 0 {
            inner.faults.fail_exports -= 1;
            return Err(RuntimeError::Api("injected export failure".into()));
        }
        let sandbox = inner
            .sandboxes
            .get(handle)
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))?;
        if sandbox.spec.volume_path != volume_path {
            return Err(RuntimeError::Internal(format!(
                "no volume mounted at {volume_path}"
            )));
        }
        Ok(sandbox.volume.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbox_common::ResourceLimits;

    fn spec(restore: Option<&'static [u8]>) -> LaunchSpec {
        LaunchSpec {
            name: "agentbox-test".into(),
            image: "busybox".into(),
            limits: ResourceLimits::default(),
            env: HashMap::new(),
            port: 8080,
            volume_path: "/workspace".into(),
            labels: HashMap::new(),
            restore_from: restore.map(Bytes::from_static),
        }
    }

    #[tokio::test]
    async fn test_restore_then_export() {
        let runtime = MemoryRuntime::new();
        let handle = runtime.create_and_start(&spec(Some(b"seed"))).await.unwrap();
        assert_eq!(runtime.volume(&handle).unwrap(), Bytes::from_static(b"seed"));

        runtime.write_volume(&handle, "edited").unwrap();
        runtime.stop(&handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(runtime.state(&handle), Some(RuntimeState::Exited));
        let exported = runtime.export_volume(&handle, "/workspace").await.unwrap();
        assert_eq!(exported, Bytes::from_static(b"edited"));
    }

    #[tokio::test]
    async fn test_injected_create_failure() {
        let runtime = MemoryRuntime::new();
        runtime.set_faults(RuntimeFaults {
            fail_creates: 1,
            ..Default::default()
        });
        assert!(runtime.create_and_start(&spec(None)).await.is_err());
        assert!(runtime.create_and_start(&spec(None)).await.is_ok());
        assert_eq!(runtime.create_count(), 2);
        assert_eq!(runtime.live_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_sandbox() {
        let runtime = MemoryRuntime::new();
        let handle = runtime.create_and_start(&spec(None)).await.unwrap();
        assert!(runtime.delete_externally(&handle));
        assert!(runtime
            .stop(&handle, Duration::from_secs(1))
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(runtime.inspect(&handle).await.unwrap(), None);
        runtime.remove(&handle).await.unwrap();
    }
}
