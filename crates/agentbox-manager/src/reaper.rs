use crate::config::{ManagerConfig, TemplateCatalog};
use crate::provisioner::container_name;
use crate::registry::{no_change, Expect, InstanceRegistry, RegistryError};
use crate::retry::with_retry;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::snapshot::SnapshotStore;
use agentbox_common::{
    ContainerInstance, InstanceId, InstanceStatus, LeaseError, ReclaimReason, Result,
    StorageVolume, DEFAULT_VOLUME_PATH,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub reclaimed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub stale_provisioning: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Torn down and finalized in this terminal status.
    Reclaimed(InstanceStatus),
    /// Teardown failed; the instance is now ERROR.
    Failed(String),
    /// Another worker owns the instance, or it is no longer due.
    Skipped,
}

/// Why teardown stopped short.
enum TeardownFailure {
    Failed(String),
    /// Another reaper re-claimed the instance; this one must not touch it further.
    Superseded,
}

impl From<RuntimeError> for TeardownFailure {
    fn from(e: RuntimeError) -> Self {
        TeardownFailure::Failed(format!("runtime: {e}"))
    }
}

/// Instances whose teardown is running in this process.
#[derive(Default)]
struct InFlight(Mutex<HashSet<InstanceId>>);

impl InFlight {
    fn enter(&self, id: InstanceId) -> Option<InFlightGuard<'_>> {
        let inserted = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        // The guard must not exist before the lock is released: its drop relocks.
        inserted.then(|| InFlightGuard { set: self, id })
    }
}

struct InFlightGuard<'a> {
    set: &'a InFlight,
    id: InstanceId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Reclaims due and stale instances: graceful stop, volume snapshot,
/// runtime removal, finalization.
///
/// Ownership of a teardown is the STOPPING record at the version this reaper
/// last wrote. Every step re-asserts it, so a reaper that was re-claimed as
/// stale stops before its next side effect.
pub struct Reaper {
    config: Arc<ManagerConfig>,
    catalog: Arc<TemplateCatalog>,
    registry: Arc<dyn InstanceRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    snapshots: Arc<dyn SnapshotStore>,
    in_flight: InFlight,
}

impl Reaper {
    pub fn new(
        config: Arc<ManagerConfig>,
        catalog: Arc<TemplateCatalog>,
        registry: Arc<dyn InstanceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            config,
            catalog,
            registry,
            runtime,
            snapshots,
            in_flight: InFlight::default(),
        }
    }

    /// One sweep. Safe to run concurrently with other sweeps and with
    /// provisioning; every instance is reclaimed by exactly one winner.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let mut report = ReapReport {
            stale_provisioning: self.fail_stale_provisioning(now).await?,
            ..Default::default()
        };

        let candidates = self
            .registry
            .list_reclaimable(now, self.config.stopping_stale_after())
            .await?;
        if candidates.is_empty() {
            return Ok(report);
        }
        debug!(count = candidates.len(), "Reclaiming instances");

        let outcomes: Vec<ReclaimOutcome> = stream::iter(candidates)
            .map(|instance| self.reclaim(instance, now))
            .buffer_unordered(self.config.reap_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                ReclaimOutcome::Reclaimed(_) => report.reclaimed += 1,
                ReclaimOutcome::Failed(_) => report.failed += 1,
                ReclaimOutcome::Skipped => report.skipped += 1,
            }
        }
        info!(
            reclaimed = report.reclaimed,
            failed = report.failed,
            skipped = report.skipped,
            stale_provisioning = report.stale_provisioning,
            "Reaper sweep finished"
        );
        Ok(report)
    }

    async fn fail_stale_provisioning(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale = self
            .registry
            .list_stale_provisioning(now, self.config.provisioning_stale_after())
            .await?;

        let mut failed = 0;
        for instance in stale {
            let result = self
                .registry
                .transition(
                    instance.id,
                    Expect::exact(&instance),
                    InstanceStatus::Error,
                    Box::new(|i: &mut ContainerInstance| {
                        i.last_error = Some("provisioning did not finish in time".into());
                    }),
                )
                .await;
            match result {
                Ok(_) => {
                    warn!(instance_id = %instance.id, "Failed stale provisioning instance");
                    failed += 1;
                    // A provisioner that died mid-launch leaves the sandbox under its name.
                    if let Err(e) = self.runtime.remove(&container_name(instance.id)).await {
                        warn!(instance_id = %instance.id, error = %e, "Could not remove stale sandbox");
                    }
                }
                Err(RegistryError::Conflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(failed)
    }

    /// Claims `instance` and tears it down. Losing the claim is `Skipped`.
    #[instrument(skip(self, instance, now), fields(instance_id = %instance.id))]
    pub async fn reclaim(&self, instance: ContainerInstance, now: DateTime<Utc>) -> ReclaimOutcome {
        // A live teardown here is never stale, whatever its record says.
        let Some(_guard) = self.in_flight.enter(instance.id) else {
            debug!("Teardown already running in this process");
            return ReclaimOutcome::Skipped;
        };
        let mut claimed = match self.claim(&instance, now).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return ReclaimOutcome::Skipped,
            Err(e) => {
                warn!(error = %e, "Claim failed");
                return ReclaimOutcome::Skipped;
            }
        };
        let reason = claimed.reclaim.unwrap_or(ReclaimReason::Expired);
        info!(?reason, handle = ?claimed.runtime_handle, "Reclaiming instance");

        match self.teardown(&mut claimed).await {
            Ok(()) => self.finalize(&claimed, reason).await,
            Err(TeardownFailure::Failed(message)) => self.fail(&claimed, message).await,
            Err(TeardownFailure::Superseded) => {
                warn!("Teardown was taken over by another reaper, backing off");
                ReclaimOutcome::Skipped
            }
        }
    }

    async fn claim(
        &self,
        instance: &ContainerInstance,
        now: DateTime<Utc>,
    ) -> Result<Option<ContainerInstance>> {
        let (expect, default_reason) = match instance.status {
            InstanceStatus::Running if instance.is_due(now) => (
                Expect::status(InstanceStatus::Running),
                ReclaimReason::Expired,
            ),
            InstanceStatus::Stopping
                if instance.updated_at + self.config.stopping_stale_after() <= now =>
            {
                // Re-claim only the exact record observed as stale.
                (Expect::exact(instance), ReclaimReason::Stale)
            }
            _ => return Ok(None),
        };

        let result = self
            .registry
            .transition(
                instance.id,
                expect,
                InstanceStatus::Stopping,
                Box::new(move |i: &mut ContainerInstance| {
                    i.reclaim.get_or_insert(default_reason);
                }),
            )
            .await;
        match result {
            Ok(claimed) => Ok(Some(claimed)),
            Err(RegistryError::Conflict { .. }) => {
                debug!(instance_id = %instance.id, "Lost reclaim claim");
                Ok(None)
            }
            Err(e) => Err(LeaseError::from(e)),
        }
    }

    /// Re-asserts ownership of `instance` and refreshes its `updated_at`.
    /// On success `instance` holds the new version.
    async fn heartbeat(
        &self,
        instance: &mut ContainerInstance,
        step: &'static str,
    ) -> std::result::Result<(), TeardownFailure> {
        match self
            .registry
            .transition(
                instance.id,
                Expect::exact(instance),
                InstanceStatus::Stopping,
                no_change(),
            )
            .await
        {
            Ok(current) => {
                *instance = current;
                Ok(())
            }
            Err(RegistryError::Conflict { version, .. }) => {
                debug!(instance_id = %instance.id, step, held = instance.version, version, "Lost teardown ownership");
                Err(TeardownFailure::Superseded)
            }
            Err(RegistryError::NotFound(_)) => Err(TeardownFailure::Superseded),
            Err(e) => Err(TeardownFailure::Failed(format!(
                "ownership check before {step}: {e}"
            ))),
        }
    }

    async fn teardown(
        &self,
        instance: &mut ContainerInstance,
    ) -> std::result::Result<(), TeardownFailure> {
        let Some(handle) = instance.runtime_handle.clone() else {
            return Ok(());
        };
        let volume_path = self
            .catalog
            .get(&instance.template_id)
            .map(|t| t.volume_path.clone())
            .unwrap_or_else(|| DEFAULT_VOLUME_PATH.to_string());

        self.heartbeat(instance, "stop").await?;
        let present = self.stop(&handle).await?;
        if present {
            self.snapshot(instance, &handle, &volume_path).await?;
        } else {
            info!(instance_id = %instance.id, handle = %handle, "Sandbox already gone, keeping previous snapshot");
        }

        self.heartbeat(instance, "remove").await?;
        with_retry(
            &self.config.retry,
            self.config.step_timeout(),
            "remove",
            || self.runtime.remove(&handle),
        )
        .await?;
        Ok(())
    }

    /// Graceful stop, then force kill. Returns whether the sandbox still exists.
    async fn stop(&self, handle: &str) -> std::result::Result<bool, TeardownFailure> {
        match tokio::time::timeout(self.config.step_timeout(), self.runtime.inspect(handle)).await {
            Ok(Ok(None)) => return Ok(false),
            Ok(Err(e)) => debug!(handle, error = %e, "Inspect failed, stopping anyway"),
            _ => {}
        }

        let grace = self.config.stop_timeout();
        // The runtime gets the grace period plus room to answer.
        let deadline = grace + self.config.step_timeout();
        let stopped = match tokio::time::timeout(deadline, self.runtime.stop(handle, grace)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(deadline)),
        };

        match stopped {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => {
                warn!(handle, error = %e, "Graceful stop failed, killing");
                match with_retry(
                    &self.config.retry,
                    self.config.step_timeout(),
                    "kill",
                    || self.runtime.kill(handle),
                )
                .await
                {
                    Ok(()) => Ok(true),
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn snapshot(
        &self,
        instance: &mut ContainerInstance,
        handle: &str,
        volume_path: &str,
    ) -> std::result::Result<(), TeardownFailure> {
        self.heartbeat(instance, "export_volume").await?;
        let archive = match with_retry(
            &self.config.retry,
            self.config.step_timeout(),
            "export_volume",
            || self.runtime.export_volume(handle, volume_path),
        )
        .await
        {
            Ok(archive) => archive,
            Err(e) if e.is_not_found() => {
                info!(instance_id = %instance.id, handle, "Sandbox vanished before export");
                return Ok(());
            }
            Err(e) => {
                return Err(TeardownFailure::Failed(format!(
                    "export of {handle} failed, sandbox kept for diagnosis: {e}"
                )))
            }
        };

        let key = agentbox_common::snapshot_key(&instance.user_id, &instance.template_id);
        self.heartbeat(instance, "snapshot_put").await?;
        let put = with_retry(
            &self.config.retry,
            self.config.step_timeout(),
            "snapshot_put",
            || self.snapshots.put(&key, archive.clone()),
        )
        .await
        .map_err(|e| {
            TeardownFailure::Failed(format!(
                "upload of {handle} failed, sandbox kept for diagnosis: {e}"
            ))
        })?;

        self.heartbeat(instance, "upsert_volume").await?;
        self.registry
            .upsert_volume(StorageVolume {
                user_id: instance.user_id.clone(),
                template_id: instance.template_id.clone(),
                storage_key: key,
                size_bytes: put.size_bytes,
                sha256: put.sha256,
                last_sync_at: Utc::now(),
            })
            .await
            .map_err(|e| TeardownFailure::Failed(format!("snapshot metadata: {e}")))?;

        debug!(
            instance_id = %instance.id,
            size_bytes = put.size_bytes,
            stored_bytes = put.stored_bytes,
            "Snapshot saved"
        );
        Ok(())
    }

    async fn finalize(&self, instance: &ContainerInstance, reason: ReclaimReason) -> ReclaimOutcome {
        let status = reason.terminal_status();
        match self
            .registry
            .transition(
                instance.id,
                Expect::exact(instance),
                status,
                Box::new(|i: &mut ContainerInstance| i.last_error = None),
            )
            .await
        {
            Ok(_) => {
                info!(instance_id = %instance.id, %status, "Instance reclaimed");
                ReclaimOutcome::Reclaimed(status)
            }
            Err(RegistryError::Conflict { .. }) => {
                warn!(instance_id = %instance.id, "Teardown was taken over before finalizing");
                ReclaimOutcome::Skipped
            }
            Err(e) => {
                error!(instance_id = %instance.id, error = %e, "Could not finalize instance");
                ReclaimOutcome::Failed(e.to_string())
            }
        }
    }

    async fn fail(&self, instance: &ContainerInstance, message: String) -> ReclaimOutcome {
        error!(instance_id = %instance.id, error = %message, "Reclamation failed");
        let recorded = message.clone();
        if let Err(e) = self
            .registry
            .transition(
                instance.id,
                Expect::exact(instance),
                InstanceStatus::Error,
                Box::new(move |i: &mut ContainerInstance| i.last_error = Some(recorded)),
            )
            .await
        {
            warn!(instance_id = %instance.id, error = %e, "Could not record reclamation failure");
        }
        ReclaimOutcome::Failed(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CreateLimits, MemoryRegistry};
    use crate::runtime::{LaunchSpec, MemoryRuntime};
    use crate::snapshot::ObjectSnapshotStore;
    use agentbox_common::ResourceLimits;
    use chrono::Duration;
    use std::collections::HashMap;

    struct Fixture {
        reaper: Reaper,
        registry: MemoryRegistry,
        runtime: MemoryRuntime,
    }

    fn fixture() -> Fixture {
        let registry = MemoryRegistry::new();
        let runtime = MemoryRuntime::new();
        let config = ManagerConfig {
            stop_timeout_secs: 0,
            step_timeout_secs: 1,
            ..Default::default()
        };
        let reaper = Reaper::new(
            Arc::new(config),
            Arc::new(TemplateCatalog::new(Vec::new())),
            Arc::new(registry.clone()),
            Arc::new(runtime.clone()),
            Arc::new(ObjectSnapshotStore::in_memory()),
        );
        Fixture {
            reaper,
            registry,
            runtime,
        }
    }

    impl Fixture {
        /// A second reaper over the same backends, as on another host.
        fn peer(&self) -> Reaper {
            Reaper::new(
                self.reaper.config.clone(),
                self.reaper.catalog.clone(),
                Arc::new(self.registry.clone()),
                Arc::new(self.runtime.clone()),
                self.reaper.snapshots.clone(),
            )
        }
    }

    /// A RUNNING instance backed by a live sandbox.
    async fn running(f: &Fixture, user: &str, expires_in: Duration) -> ContainerInstance {
        let handle = f
            .runtime
            .create_and_start(&LaunchSpec {
                name: format!("agentbox-{user}"),
                image: "busybox".into(),
                limits: ResourceLimits::default(),
                env: HashMap::new(),
                port: 8080,
                volume_path: DEFAULT_VOLUME_PATH.into(),
                labels: HashMap::new(),
                restore_from: None,
            })
            .await
            .unwrap();

        let now = Utc::now();
        let pending = ContainerInstance::pending(
            user,
            "agent",
            format!("agent-{user}"),
            None,
            now,
            now + expires_in,
        );
        let created = f
            .registry
            .create(pending, CreateLimits::default())
            .await
            .unwrap();
        f.registry
            .transition(
                created.id,
                Expect::exact(&created),
                InstanceStatus::Running,
                Box::new(move |i: &mut ContainerInstance| i.runtime_handle = Some(handle)),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_expired_instance_is_reclaimed() {
        let f = fixture();
        let instance = running(&f, "ann", Duration::minutes(5)).await;

        let outcome = f.reaper.reclaim(instance.clone(), Utc::now()).await;
        assert_eq!(outcome, ReclaimOutcome::Skipped);

        let later = Utc::now() + Duration::minutes(10);
        let outcome = f.reaper.reclaim(instance.clone(), later).await;
        assert_eq!(outcome, ReclaimOutcome::Reclaimed(InstanceStatus::Expired));

        let current = f.registry.find(instance.id).await.unwrap().unwrap();
        assert_eq!(current.reclaim, Some(ReclaimReason::Expired));
        assert_eq!(f.runtime.live_count(), 0);

        // A second attempt on the same observed record loses the claim.
        assert_eq!(f.reaper.reclaim(instance, later).await, ReclaimOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_abandoned_stopping_instance_is_recovered() {
        let f = fixture();
        let instance = running(&f, "ben", Duration::hours(1)).await;

        // A reaper claimed it and died before teardown.
        let abandoned = f
            .registry
            .transition(
                instance.id,
                Expect::exact(&instance),
                InstanceStatus::Stopping,
                no_change(),
            )
            .await
            .unwrap();

        let report = f.reaper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.reclaimed, 0);

        let report = f
            .reaper
            .sweep(abandoned.updated_at + Duration::minutes(16))
            .await
            .unwrap();
        assert_eq!(report.reclaimed, 1);

        let current = f.registry.find(instance.id).await.unwrap().unwrap();
        assert_eq!(current.status, InstanceStatus::Stopped);
        assert_eq!(current.reclaim, Some(ReclaimReason::Stale));
        assert!(current.runtime_handle.is_none());
        assert_eq!(f.runtime.live_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_reclaim_shuts_out_previous_owner() {
        let f = fixture();
        let other = f.peer();
        let instance = running(&f, "cal", Duration::minutes(5)).await;
        let later = Utc::now() + Duration::minutes(10);

        // The first reaper claims, then stalls long enough to look abandoned.
        let mut held = f.reaper.claim(&instance, later).await.unwrap().unwrap();
        let stale_at = held.updated_at + Duration::minutes(16);
        assert_eq!(
            other.reclaim(held.clone(), stale_at).await,
            ReclaimOutcome::Reclaimed(InstanceStatus::Expired)
        );
        assert_eq!(f.runtime.remove_count(), 1);

        // When it resumes, none of its steps land.
        assert!(matches!(
            f.reaper.teardown(&mut held).await,
            Err(TeardownFailure::Superseded)
        ));
        assert_eq!(
            f.reaper.finalize(&held, ReclaimReason::Expired).await,
            ReclaimOutcome::Skipped
        );
        f.reaper.fail(&held, "late failure".into()).await;

        let current = f.registry.find(instance.id).await.unwrap().unwrap();
        assert_eq!(current.status, InstanceStatus::Expired);
        assert_eq!(current.last_error, None);
        assert_eq!(f.runtime.remove_count(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_live_owner() {
        let f = fixture();
        let other = f.peer();
        let instance = running(&f, "dee", Duration::minutes(5)).await;
        let later = Utc::now() + Duration::minutes(10);

        let mut held = f.reaper.claim(&instance, later).await.unwrap().unwrap();
        let observed = held.clone();
        assert!(f.reaper.heartbeat(&mut held, "stop").await.is_ok());
        assert_eq!(held.version, observed.version + 1);
        assert!(held.updated_at >= observed.updated_at);

        // A peer that saw the record before the heartbeat cannot take it.
        let stale_at = observed.updated_at + Duration::minutes(16);
        assert_eq!(other.reclaim(observed, stale_at).await, ReclaimOutcome::Skipped);

        assert!(f.reaper.teardown(&mut held).await.is_ok());
        assert_eq!(
            f.reaper.finalize(&held, ReclaimReason::Expired).await,
            ReclaimOutcome::Reclaimed(InstanceStatus::Expired)
        );
        assert_eq!(f.runtime.remove_count(), 1);
    }

    #[tokio::test]
    async fn test_teardown_in_progress_is_not_reclaimed_twice() {
        let f = fixture();
        let instance = running(&f, "eve", Duration::minutes(5)).await;

        let guard = f.reaper.in_flight.enter(instance.id).unwrap();
        assert!(f.reaper.in_flight.enter(instance.id).is_none());
        // A rejected entry leaves the owner's claim in place.
        assert!(f.reaper.in_flight.enter(instance.id).is_none());

        let later = Utc::now() + Duration::hours(1);
        assert_eq!(f.reaper.reclaim(instance.clone(), later).await, ReclaimOutcome::Skipped);
        let current = f.registry.find(instance.id).await.unwrap().unwrap();
        assert_eq!(current.status, InstanceStatus::Running);
        assert_eq!(f.runtime.remove_count(), 0);

        drop(guard);
        assert_eq!(
            f.reaper.reclaim(instance, later).await,
            ReclaimOutcome::Reclaimed(InstanceStatus::Expired)
        );
        assert_eq!(f.runtime.remove_count(), 1);
    }
}
