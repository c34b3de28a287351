use crate::config::{BillingMode, ManagerConfig, TemplateCatalog};
use crate::registry::{CreateLimits, Expect, InstanceRegistry, RegistryError};
use crate::retry::with_retry;
use crate::runtime::{ContainerRuntime, LaunchSpec};
use crate::snapshot::{sha256_hex, SnapshotStore, StoreError};
use agentbox_billing::{BillingClient, BillingError};
use agentbox_common::{
    instance_url, snapshot_key, AccessSecret, AgentTemplate, ContainerInstance, InstanceId,
    InstanceStatus, LeaseError, ProvisionResult, ReclaimReason, Result,
};
use bytes::Bytes;
use chrono::{Duration, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

const SUBDOMAIN_ATTEMPTS: usize = 5;
const ACCESS_SECRET_LEN: usize = 32;

/// Name given to the sandbox of an instance, so a half-created sandbox can be
/// found without a recorded handle.
pub fn container_name(id: InstanceId) -> String {
    format!("agentbox-{id}")
}

fn random_subdomain(slug: &str) -> String {
    format!("{slug}-{:08x}", rand::rng().random::<u32>())
}

fn generate_access_secret() -> AccessSecret {
    let secret: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ACCESS_SECRET_LEN)
        .map(char::from)
        .collect();
    AccessSecret::new(secret)
}

/// Validates lease requests and brings sandboxes up.
pub struct Provisioner {
    config: Arc<ManagerConfig>,
    catalog: Arc<TemplateCatalog>,
    registry: Arc<dyn InstanceRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    snapshots: Arc<dyn SnapshotStore>,
    billing: Arc<dyn BillingClient>,
}

impl Provisioner {
    pub fn new(
        config: Arc<ManagerConfig>,
        catalog: Arc<TemplateCatalog>,
        registry: Arc<dyn InstanceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        snapshots: Arc<dyn SnapshotStore>,
        billing: Arc<dyn BillingClient>,
    ) -> Self {
        Self {
            config,
            catalog,
            registry,
            runtime,
            snapshots,
            billing,
        }
    }

    #[instrument(skip(self))]
    pub async fn provision(
        &self,
        user_id: &str,
        template_id: &str,
        hours: u32,
    ) -> Result<ProvisionResult> {
        let template = self.validate(user_id, template_id, hours).await?;

        if self
            .registry
            .find_active(user_id, template_id)
            .await?
            .is_some()
        {
            return Err(LeaseError::AlreadyProvisioned {
                user_id: user_id.to_string(),
                template_id: template_id.to_string(),
            });
        }

        let required = template.lease_cost(hours);
        let available = self.billing.get_balance(user_id).await?;
        if available < required {
            return Err(LeaseError::InsufficientBalance {
                required,
                available,
            });
        }

        let instance = self.register(user_id, &template, hours).await?;
        info!(
            instance_id = %instance.id,
            subdomain = %instance.subdomain,
            expires_at = %instance.expires_at,
            "Instance registered"
        );

        let handle = match self.launch(&template, &instance).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(&instance, &e).await;
                return Err(e);
            }
        };

        let running = match self
            .registry
            .transition(
                instance.id,
                Expect::status(InstanceStatus::Provisioning),
                InstanceStatus::Running,
                Box::new({
                    let handle = handle.clone();
                    move |i: &mut ContainerInstance| {
                        i.runtime_handle = Some(handle);
                        i.last_metered_at = Utc::now();
                    }
                }),
            )
            .await
        {
            Ok(running) => running,
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Lost RUNNING transition, removing sandbox");
                if let Err(remove_err) = self.runtime.remove(&handle).await {
                    error!(instance_id = %instance.id, error = %remove_err, "Failed to remove orphaned sandbox");
                }
                return Err(match e {
                    RegistryError::Conflict { .. } => LeaseError::Conflict(format!(
                        "instance {} was reclaimed during startup",
                        instance.id
                    )),
                    other => other.into(),
                });
            }
        };

        if self.config.billing_mode == BillingMode::Prepaid && required > 0 {
            self.charge_lease(&running, required).await?;
        }

        info!(instance_id = %running.id, handle = %handle, "Instance running");
        Ok(ProvisionResult {
            instance_id: running.id,
            url: instance_url(&running.subdomain, &self.config.public_domain),
            access_secret: running.access_secret.clone(),
            expires_at: running.expires_at,
        })
    }

    async fn validate(&self, user_id: &str, template_id: &str, hours: u32) -> Result<AgentTemplate> {
        if user_id.trim().is_empty() {
            return Err(LeaseError::Validation("user_id must not be empty".into()));
        }
        if hours == 0 || hours > self.config.max_lease_hours {
            return Err(LeaseError::Validation(format!(
                "hours must be between 1 and {}",
                self.config.max_lease_hours
            )));
        }
        let template = match self.catalog.get(template_id) {
            Some(template) if template.active => template.clone(),
            Some(_) => {
                return Err(LeaseError::Validation(format!(
                    "agent {template_id} is not available"
                )))
            }
            None => {
                return Err(LeaseError::Validation(format!(
                    "unknown agent {template_id}"
                )))
            }
        };

        let tier = self.billing.get_tier(user_id).await?;
        if !tier.satisfies(template.required_tier) {
            return Err(LeaseError::Validation(format!(
                "agent {template_id} requires the {:?} tier",
                template.required_tier
            )));
        }
        Ok(template)
    }

    async fn register(
        &self,
        user_id: &str,
        template: &AgentTemplate,
        hours: u32,
    ) -> Result<ContainerInstance> {
        let limits = CreateLimits {
            max_active_total: Some(self.config.max_active_total),
            max_active_per_user: Some(self.config.max_active_per_user),
        };
        let now = Utc::now();
        let expires_at = now + Duration::hours(i64::from(hours));
        let access_secret = template.terminal_access.then(generate_access_secret);

        for attempt in 1..=SUBDOMAIN_ATTEMPTS {
            let pending = ContainerInstance::pending(
                user_id,
                &template.id,
                random_subdomain(&template.slug),
                access_secret.clone(),
                now,
                expires_at,
            );
            match self.registry.create(pending, limits).await {
                Ok(instance) => return Ok(instance),
                Err(RegistryError::SubdomainTaken(subdomain)) => {
                    debug!(attempt, subdomain = %subdomain, "Subdomain collision");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LeaseError::Internal(format!(
            "no free subdomain after {SUBDOMAIN_ATTEMPTS} attempts"
        )))
    }

    /// Fetches the live snapshot of the pair, if any. A snapshot the registry
    /// knows about must be fetchable and intact.
    async fn restore_archive(&self, user_id: &str, template_id: &str) -> Result<Option<Bytes>> {
        let volume = self.registry.find_volume(user_id, template_id).await?;
        let key = volume
            .as_ref()
            .map(|v| v.storage_key.clone())
            .unwrap_or_else(|| snapshot_key(user_id, template_id));

        let archive = with_retry(
            &self.config.retry,
            self.config.step_timeout(),
            "snapshot_get",
            || self.snapshots.get(&key),
        )
        .await?;

        match (archive, volume) {
            (Some(archive), Some(volume)) => {
                if sha256_hex(&archive) != volume.sha256 {
                    return Err(StoreError::Corrupt(key, "digest mismatch".into()).into());
                }
                Ok(Some(archive))
            }
            (Some(archive), None) => Ok(Some(archive)),
            (None, Some(_)) => Err(LeaseError::Store(format!("snapshot {key} is missing"))),
            (None, None) => Ok(None),
        }
    }

    async fn launch(&self, template: &AgentTemplate, instance: &ContainerInstance) -> Result<String> {
        let restore_from = self
            .restore_archive(&instance.user_id, &instance.template_id)
            .await?;
        if let Some(archive) = &restore_from {
            debug!(instance_id = %instance.id, bytes = archive.len(), "Restoring snapshot");
        }

        let mut env = template.env.clone();
        env.insert("AGENTBOX_INSTANCE_ID".into(), instance.id.to_string());
        env.insert("AGENTBOX_SUBDOMAIN".into(), instance.subdomain.clone());
        env.insert("AGENTBOX_PORT".into(), template.port.to_string());
        if let Some(secret) = &instance.access_secret {
            env.insert("AGENTBOX_ACCESS_SECRET".into(), secret.expose().to_string());
        }

        let spec = LaunchSpec {
            name: container_name(instance.id),
            image: template.image.clone(),
            limits: template.limits,
            env,
            port: template.port,
            volume_path: template.volume_path.clone(),
            labels: HashMap::from([
                ("agentbox.instance".to_string(), instance.id.to_string()),
                ("agentbox.user".to_string(), instance.user_id.clone()),
                ("agentbox.template".to_string(), instance.template_id.clone()),
                ("agentbox.subdomain".to_string(), instance.subdomain.clone()),
                ("agentbox.port".to_string(), template.port.to_string()),
            ]),
            restore_from,
        };

        let launched = with_retry(
            &self.config.retry,
            self.config.provision_timeout(),
            "create_and_start",
            || self.runtime.create_and_start(&spec),
        )
        .await;

        match launched {
            Ok(handle) => Ok(handle),
            Err(e) => {
                // An attempt that timed out may still have created the sandbox.
                if let Err(cleanup) = self.runtime.remove(&spec.name).await {
                    warn!(instance_id = %instance.id, error = %cleanup, "Cleanup after failed launch failed");
                }
                Err(e.into())
            }
        }
    }

    async fn fail(&self, instance: &ContainerInstance, err: &LeaseError) {
        error!(instance_id = %instance.id, error = %err, "Provisioning failed");
        let message = err.to_string();
        if let Err(e) = self
            .registry
            .transition(
                instance.id,
                Expect::status(InstanceStatus::Provisioning),
                InstanceStatus::Error,
                Box::new(move |i: &mut ContainerInstance| i.last_error = Some(message)),
            )
            .await
        {
            warn!(instance_id = %instance.id, error = %e, "Could not record provisioning failure");
        }
    }

    /// Debits the whole lease once. A refused debit flags the instance so the
    /// reaper takes it down. An unanswered one may still have landed, so the
    /// lease keeps running and the instance carries the error for reconciliation.
    async fn charge_lease(&self, instance: &ContainerInstance, tokens: u64) -> Result<()> {
        let reason = format!("lease {} ({})", instance.id, instance.template_id);
        match self.billing.debit(&instance.user_id, tokens, &reason).await {
            Ok(()) => {
                debug!(instance_id = %instance.id, tokens, "Lease debited");
                self.record_debit(instance.id, tokens).await;
                Ok(())
            }
            Err(e @ (BillingError::InsufficientBalance { .. } | BillingError::AccountNotFound(_))) => {
                warn!(instance_id = %instance.id, error = %e, "Lease debit refused, flagging instance");
                self.flag_exhausted(instance.id).await;
                Err(e.into())
            }
            Err(e) => {
                error!(instance_id = %instance.id, tokens, error = %e, "Lease debit unconfirmed");
                self.record_billing_error(
                    instance.id,
                    format!("lease debit of {tokens} tokens unconfirmed: {e}"),
                )
                .await;
                Ok(())
            }
        }
    }

    async fn record_billing_error(&self, id: InstanceId, message: String) {
        if let Err(e) = self
            .registry
            .transition(
                id,
                Expect::status(InstanceStatus::Running),
                InstanceStatus::Running,
                Box::new(move |i: &mut ContainerInstance| i.last_error = Some(message)),
            )
            .await
        {
            warn!(instance_id = %id, error = %e, "Could not record billing error");
        }
    }

    // The reaper may already own the instance, so the debit is recorded in
    // whichever active state it is in.
    async fn record_debit(&self, id: InstanceId, tokens: u64) {
        for status in [InstanceStatus::Running, InstanceStatus::Stopping] {
            let result = self
                .registry
                .transition(
                    id,
                    Expect::status(status),
                    status,
                    Box::new(move |i: &mut ContainerInstance| {
                        i.tokens_debited = i.tokens_debited.saturating_add(tokens);
                    }),
                )
                .await;
            match result {
                Ok(_) => return,
                Err(RegistryError::Conflict { .. }) => continue,
                Err(e) => {
                    error!(instance_id = %id, tokens, error = %e, "Could not record lease debit");
                    return;
                }
            }
        }
        error!(instance_id = %id, tokens, "Debited instance is no longer active");
    }

    async fn flag_exhausted(&self, id: InstanceId) {
        if let Err(e) = self
            .registry
            .transition(
                id,
                Expect::status(InstanceStatus::Running),
                InstanceStatus::Running,
                Box::new(|i: &mut ContainerInstance| {
                    i.reclaim.get_or_insert(ReclaimReason::EntitlementExhausted);
                }),
            )
            .await
        {
            warn!(instance_id = %id, error = %e, "Could not flag instance");
        }
    }
}
