use super::{CreateLimits, Expect, InstanceRegistry, Mutation, RegistryError, Result};
use agentbox_common::{ContainerInstance, InstanceId, InstanceStatus, StorageVolume};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Default)]
struct State {
    instances: HashMap<InstanceId, ContainerInstance>,
    volumes: HashMap<(String, String), StorageVolume>,
}

#[derive(Default, Serialize, Deserialize)]
struct PersistedState {
    instances: Vec<ContainerInstance>,
    volumes: Vec<StorageVolume>,
}

impl State {
    fn to_persisted(&self) -> PersistedState {
        PersistedState {
            instances: self.instances.values().cloned().collect(),
            volumes: self.volumes.values().cloned().collect(),
        }
    }

    fn from_persisted(persisted: PersistedState) -> Self {
        Self {
            instances: persisted
                .instances
                .into_iter()
                .map(|i| (i.id, i))
                .collect(),
            volumes: persisted
                .volumes
                .into_iter()
                .map(|v| ((v.user_id.clone(), v.template_id.clone()), v))
                .collect(),
        }
    }

    fn active(&self) -> impl Iterator<Item = &ContainerInstance> {
        self.instances.values().filter(|i| i.status.is_active())
    }
}

/// Registry held in memory, optionally mirrored to a JSON file that is
/// rewritten atomically after every change and reloaded on start.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<Mutex<State>>,
    path: Option<PathBuf>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a file-backed registry, loading any existing state.
    pub async fn persistent(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let persisted: PersistedState = serde_json::from_slice(&raw)
                    .map_err(|e| RegistryError::Persistence(format!("{}: {e}", path.display())))?;
                info!(
                    path = %path.display(),
                    instances = persisted.instances.len(),
                    volumes = persisted.volumes.len(),
                    "Loaded registry state"
                );
                State::from_persisted(persisted)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Starting with empty registry state");
                State::default()
            }
            Err(e) => {
                return Err(RegistryError::Persistence(format!(
                    "{}: {e}",
                    path.display()
                )))
            }
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            path: Some(path),
        })
    }

    async fn persist(&self, state: &State) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = serde_json::to_vec_pretty(&state.to_persisted())
            .map_err(|e| RegistryError::Persistence(e.to_string()))?;
        write_atomic(path, &raw)
            .await
            .map_err(|e| RegistryError::Persistence(format!("{}: {e}", path.display())))
    }
}

async fn write_atomic(path: &Path, raw: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, raw).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl InstanceRegistry for MemoryRegistry {
    async fn create(
        &self,
        instance: ContainerInstance,
        limits: CreateLimits,
    ) -> Result<ContainerInstance> {
        if instance.status != InstanceStatus::Provisioning || instance.runtime_handle.is_some() {
            return Err(RegistryError::Invariant(
                "new instances must be PROVISIONING without a runtime handle".into(),
            ));
        }

        let mut state = self.state.lock().await;
        if state.instances.contains_key(&instance.id) {
            return Err(RegistryError::Invariant(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        if state
            .active()
            .any(|i| i.user_id == instance.user_id && i.template_id == instance.template_id)
        {
            return Err(RegistryError::ActiveLeaseExists {
                user_id: instance.user_id,
                template_id: instance.template_id,
            });
        }
        if state.active().any(|i| i.subdomain == instance.subdomain) {
            return Err(RegistryError::SubdomainTaken(instance.subdomain));
        }
        if let Some(max) = limits.max_active_total {
            if state.active().count() >= max {
                return Err(RegistryError::CapacityExceeded(format!(
                    "{max} active instances"
                )));
            }
        }
        if let Some(max) = limits.max_active_per_user {
            let count = state
                .active()
                .filter(|i| i.user_id == instance.user_id)
                .count();
            if count >= max {
                return Err(RegistryError::CapacityExceeded(format!(
                    "user {} has {count} active instances",
                    instance.user_id
                )));
            }
        }

        state.instances.insert(instance.id, instance.clone());
        if let Err(e) = self.persist(&state).await {
            state.instances.remove(&instance.id);
            return Err(e);
        }
        debug!(instance_id = %instance.id, user_id = %instance.user_id, "registered instance");
        Ok(instance)
    }

    async fn transition(
        &self,
        id: InstanceId,
        expect: Expect,
        to: InstanceStatus,
        mutate: Mutation,
    ) -> Result<ContainerInstance> {
        let mut state = self.state.lock().await;
        let current = state
            .instances
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))?;

        if !expect.matches(&current) {
            return Err(RegistryError::Conflict {
                id,
                expected: expect.describe(),
                actual: current.status,
                version: current.version,
            });
        }
        if !current.status.can_transition_to(to) {
            return Err(RegistryError::IllegalTransition {
                id,
                from: current.status,
                to,
            });
        }

        let mut next = current.clone();
        mutate(&mut next);

        // Identity is fixed at creation.
        next.id = current.id;
        next.user_id = current.user_id.clone();
        next.template_id = current.template_id.clone();
        next.subdomain = current.subdomain.clone();
        next.access_secret = current.access_secret.clone();
        next.created_at = current.created_at;

        if next.tokens_consumed < current.tokens_consumed {
            return Err(RegistryError::Invariant(format!(
                "tokens_consumed of {id} would decrease from {} to {}",
                current.tokens_consumed, next.tokens_consumed
            )));
        }
        if to == InstanceStatus::Running && next.runtime_handle.is_none() {
            return Err(RegistryError::Invariant(format!(
                "RUNNING instance {id} needs a runtime handle"
            )));
        }

        next.status = to;
        if to.is_terminal() {
            next.runtime_handle = None;
        }
        next.version = current.version + 1;
        next.updated_at = Utc::now();

        state.instances.insert(id, next.clone());
        if let Err(e) = self.persist(&state).await {
            warn!(instance_id = %id, error = %e, "rolling back transition");
            state.instances.insert(id, current);
            return Err(e);
        }

        if current.status != to {
            debug!(instance_id = %id, from = %current.status, to = %to, "instance transitioned");
        }
        Ok(next)
    }

    async fn find(&self, id: InstanceId) -> Result<Option<ContainerInstance>> {
        Ok(self.state.lock().await.instances.get(&id).cloned())
    }

    async fn find_active(
        &self,
        user_id: &str,
        template_id: &str,
    ) -> Result<Option<ContainerInstance>> {
        Ok(self
            .state
            .lock()
            .await
            .active()
            .find(|i| i.user_id == user_id && i.template_id == template_id)
            .cloned())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<ContainerInstance>> {
        let mut instances: Vec<_> = self
            .state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(instances)
    }

    async fn list_running(&self) -> Result<Vec<ContainerInstance>> {
        Ok(self
            .state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Running)
            .cloned()
            .collect())
    }

    async fn list_reclaimable(
        &self,
        now: DateTime<Utc>,
        stopping_stale_after: Duration,
    ) -> Result<Vec<ContainerInstance>> {
        let mut due: Vec<_> = self
            .state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| match i.status {
                InstanceStatus::Running => i.is_due(now),
                InstanceStatus::Stopping => i.updated_at + stopping_stale_after <= now,
                _ => false,
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(due)
    }

    async fn list_stale_provisioning(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<ContainerInstance>> {
        Ok(self
            .state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| {
                i.status == InstanceStatus::Provisioning && i.created_at + stale_after <= now
            })
            .cloned()
            .collect())
    }

    async fn count_active(&self, user_id: Option<&str>) -> Result<usize> {
        Ok(self
            .state
            .lock()
            .await
            .active()
            .filter(|i| user_id.map_or(true, |u| i.user_id == u))
            .count())
    }

    async fn find_volume(
        &self,
        user_id: &str,
        template_id: &str,
    ) -> Result<Option<StorageVolume>> {
        Ok(self
            .state
            .lock()
            .await
            .volumes
            .get(&(user_id.to_string(), template_id.to_string()))
            .cloned())
    }

    async fn upsert_volume(&self, volume: StorageVolume) -> Result<()> {
        let key = (volume.user_id.clone(), volume.template_id.clone());
        let mut state = self.state.lock().await;
        let previous = state.volumes.insert(key.clone(), volume);
        if let Err(e) = self.persist(&state).await {
            match previous {
                Some(previous) => state.volumes.insert(key, previous),
                None => state.volumes.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }
}
