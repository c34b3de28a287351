use crate::config::{ManagerConfig, TemplateCatalog};
use crate::meter::{MeterReport, UsageMeter};
use crate::provisioner::Provisioner;
use crate::reaper::{ReapReport, Reaper, ReclaimOutcome};
use crate::registry::{Expect, InstanceRegistry, RegistryError};
use crate::runtime::ContainerRuntime;
use crate::snapshot::SnapshotStore;
use agentbox_billing::BillingClient;
use agentbox_common::{
    AgentTemplate, ContainerInfo, ContainerInstance, InstanceId, InstanceStatus, LeaseError,
    ProvisionResult, ReclaimReason, Result,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

/// Signed, time-limited snapshot download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadLink {
    pub url: String,
    pub expires_in_secs: u64,
}

/// Wires the registry, runtime, snapshot store and billing client into the
/// lease lifecycle.
pub struct LeaseManager {
    config: Arc<ManagerConfig>,
    catalog: Arc<TemplateCatalog>,
    registry: Arc<dyn InstanceRegistry>,
    snapshots: Arc<dyn SnapshotStore>,
    provisioner: Provisioner,
    meter: UsageMeter,
    reaper: Reaper,
}

impl LeaseManager {
    pub fn new(
        config: ManagerConfig,
        registry: Arc<dyn InstanceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        snapshots: Arc<dyn SnapshotStore>,
        billing: Arc<dyn BillingClient>,
    ) -> Self {
        let catalog = Arc::new(TemplateCatalog::new(config.templates.clone()));
        let config = Arc::new(config);

        let provisioner = Provisioner::new(
            config.clone(),
            catalog.clone(),
            registry.clone(),
            runtime.clone(),
            snapshots.clone(),
            billing.clone(),
        );
        let meter = UsageMeter::new(config.clone(), catalog.clone(), registry.clone(), billing);
        let reaper = Reaper::new(
            config.clone(),
            catalog.clone(),
            registry.clone(),
            runtime,
            snapshots.clone(),
        );

        Self {
            config,
            catalog,
            registry,
            snapshots,
            provisioner,
            meter,
            reaper,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The reaper, for sweeps at an explicit time.
    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    pub fn meter(&self) -> &UsageMeter {
        &self.meter
    }

    pub fn templates(&self) -> Vec<AgentTemplate> {
        self.catalog.active()
    }

    pub async fn provision(
        &self,
        user_id: &str,
        template_id: &str,
        hours: u32,
    ) -> Result<ProvisionResult> {
        self.provisioner.provision(user_id, template_id, hours).await
    }

    pub async fn list_instances(&self, user_id: &str) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .registry
            .list_by_user(user_id)
            .await?
            .iter()
            .map(|i| ContainerInfo::from_instance(i, &self.config.public_domain))
            .collect())
    }

    pub async fn get_instance(&self, id: InstanceId) -> Result<ContainerInstance> {
        self.registry
            .find(id)
            .await?
            .ok_or_else(|| LeaseError::NotFound(format!("instance {id}")))
    }

    /// User-initiated stop. Runs the same claim and teardown as the reaper,
    /// inline. Stopping an instance that is already going away is a no-op.
    #[instrument(skip(self))]
    pub async fn stop_instance(&self, user_id: &str, id: InstanceId) -> Result<ContainerInfo> {
        let instance = self.get_instance(id).await?;
        if instance.user_id != user_id {
            return Err(LeaseError::NotFound(format!("instance {id}")));
        }

        match instance.status {
            InstanceStatus::Provisioning => {
                return Err(LeaseError::Conflict(format!(
                    "instance {id} is still provisioning"
                )))
            }
            InstanceStatus::Running => {}
            _ => return Ok(ContainerInfo::from_instance(&instance, &self.config.public_domain)),
        }

        let flagged = match self
            .registry
            .transition(
                id,
                Expect::status(InstanceStatus::Running),
                InstanceStatus::Running,
                Box::new(|i: &mut ContainerInstance| {
                    i.reclaim.get_or_insert(ReclaimReason::UserStop);
                }),
            )
            .await
        {
            Ok(flagged) => Some(flagged),
            // The reaper got there first.
            Err(RegistryError::Conflict { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(flagged) = flagged {
            if let ReclaimOutcome::Failed(message) = self.reaper.reclaim(flagged, Utc::now()).await {
                error!(instance_id = %id, error = %message, "User stop did not complete cleanly");
            }
        }

        let current = self.get_instance(id).await?;
        Ok(ContainerInfo::from_instance(&current, &self.config.public_domain))
    }

    /// One reaper sweep; idempotent and safe to call while the background
    /// reaper runs.
    pub async fn cleanup_expired(&self) -> Result<ReapReport> {
        self.reaper.sweep(Utc::now()).await
    }

    pub async fn meter_tick(&self) -> Result<MeterReport> {
        self.meter.tick(Utc::now()).await
    }

    pub async fn check_instance(&self, id: InstanceId) -> Result<ContainerInfo> {
        let instance = self.meter.check_instance(id, Utc::now()).await?;
        Ok(ContainerInfo::from_instance(&instance, &self.config.public_domain))
    }

    pub async fn snapshot_download_url(
        &self,
        user_id: &str,
        template_id: &str,
    ) -> Result<DownloadLink> {
        let volume = self
            .registry
            .find_volume(user_id, template_id)
            .await?
            .ok_or_else(|| {
                LeaseError::NotFound(format!("no snapshot of {template_id} for {user_id}"))
            })?;

        let ttl = self.config.download_url_ttl();
        let url = self
            .snapshots
            .signed_download_url(&volume.storage_key, ttl)
            .await?;
        Ok(DownloadLink {
            url: url.to_string(),
            expires_in_secs: ttl.as_secs(),
        })
    }

    /// Starts the reaper and meter loops. Dropping the returned handle stops them.
    pub fn spawn_background(self: &Arc<Self>) -> BackgroundTasks {
        let reaper = {
            let manager = self.clone();
            let period = self.config.reap_interval();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if let Err(e) = manager.cleanup_expired().await {
                        error!("Reaper sweep failed: {}", e);
                    }
                }
            })
        };

        let meter = {
            let manager = self.clone();
            let period = self.config.meter_interval();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if let Err(e) = manager.meter_tick().await {
                        error!("Meter tick failed: {}", e);
                    }
                }
            })
        };

        info!(
            reap_interval_secs = self.config.reap_interval_secs,
            meter_interval_secs = self.config.meter_interval_secs,
            "Background tasks started"
        );
        BackgroundTasks {
            handles: vec![reaper, meter],
        }
    }
}

/// Handle to the background loops; aborts them on drop.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
