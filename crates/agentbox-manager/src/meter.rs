use crate::config::{BillingMode, ManagerConfig, TemplateCatalog};
use crate::registry::{Expect, InstanceRegistry, RegistryError};
use agentbox_billing::{BillingClient, BillingError};
use agentbox_common::{
    ContainerInstance, InstanceId, InstanceStatus, LeaseError, ReclaimReason, Result,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const SECS_PER_HOUR: u128 = 3_600;

/// Tokens accrued over `elapsed_secs` at `tokens_per_hour`, and the whole
/// seconds those tokens account for. The remainder stays unbilled until the
/// next evaluation.
fn accrue(tokens_per_hour: u64, elapsed_secs: i64) -> (u64, i64) {
    if elapsed_secs <= 0 {
        return (0, 0);
    }
    if tokens_per_hour == 0 {
        return (0, elapsed_secs);
    }
    let rate = u128::from(tokens_per_hour);
    let tokens = rate * elapsed_secs as u128 / SECS_PER_HOUR;
    let accounted = (tokens * SECS_PER_HOUR).div_ceil(rate);
    (
        u64::try_from(tokens).unwrap_or(u64::MAX),
        i64::try_from(accounted).unwrap_or(elapsed_secs),
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MeterReport {
    pub evaluated: usize,
    pub tokens_accrued: u64,
    pub flagged_expired: usize,
    pub flagged_exhausted: usize,
    pub skipped: usize,
}

/// What one evaluation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Evaluation {
    accrued: u64,
    flagged: Option<ReclaimReason>,
}

/// Turns wall-clock time into token consumption and flags instances whose
/// entitlement has run out. Never touches the runtime.
pub struct UsageMeter {
    config: Arc<ManagerConfig>,
    catalog: Arc<TemplateCatalog>,
    registry: Arc<dyn InstanceRegistry>,
    billing: Arc<dyn BillingClient>,
}

impl UsageMeter {
    pub fn new(
        config: Arc<ManagerConfig>,
        catalog: Arc<TemplateCatalog>,
        registry: Arc<dyn InstanceRegistry>,
        billing: Arc<dyn BillingClient>,
    ) -> Self {
        Self {
            config,
            catalog,
            registry,
            billing,
        }
    }

    /// Evaluates every RUNNING instance.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<MeterReport> {
        let mut report = MeterReport::default();
        for instance in self.registry.list_running().await? {
            match self.evaluate(&instance, now).await {
                Ok(Some(evaluation)) => {
                    report.evaluated += 1;
                    report.tokens_accrued += evaluation.accrued;
                    match evaluation.flagged {
                        Some(ReclaimReason::Expired) => report.flagged_expired += 1,
                        Some(ReclaimReason::EntitlementExhausted) => report.flagged_exhausted += 1,
                        _ => {}
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "Metering failed");
                    report.skipped += 1;
                }
            }
        }
        if report.flagged_expired + report.flagged_exhausted > 0 {
            info!(?report, "Meter tick flagged instances");
        }
        Ok(report)
    }

    /// On-demand evaluation of one instance. Returns the current record.
    pub async fn check_instance(&self, id: InstanceId, now: DateTime<Utc>) -> Result<ContainerInstance> {
        let instance = self
            .registry
            .find(id)
            .await?
            .ok_or_else(|| LeaseError::NotFound(format!("instance {id}")))?;

        match self.evaluate(&instance, now).await {
            Ok(_) => {}
            // Someone else moved it first; report what they left.
            Err(LeaseError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }

        self.registry
            .find(id)
            .await?
            .ok_or_else(|| LeaseError::NotFound(format!("instance {id}")))
    }

    /// `Ok(None)` when the instance is not RUNNING or already flagged.
    async fn evaluate(
        &self,
        instance: &ContainerInstance,
        now: DateTime<Utc>,
    ) -> Result<Option<Evaluation>> {
        if instance.status != InstanceStatus::Running || instance.reclaim.is_some() {
            return Ok(None);
        }

        let tokens_per_hour = match self.catalog.get(&instance.template_id) {
            Some(template) => template.tokens_per_hour,
            None => {
                warn!(instance_id = %instance.id, template_id = %instance.template_id, "Unknown template, metering at zero rate");
                0
            }
        };

        // Nothing accrues past the end of the lease.
        let metered_until = now.min(instance.expires_at);
        let elapsed = (metered_until - instance.last_metered_at).num_seconds();
        let (accrued, accounted_secs) = accrue(tokens_per_hour, elapsed);
        let expired = now >= instance.expires_at;

        match self.config.billing_mode {
            BillingMode::Prepaid => {
                self.evaluate_prepaid(instance, accrued, accounted_secs, expired)
                    .await
                    .map(Some)
            }
            BillingMode::Metered => {
                self.evaluate_metered(instance, accrued, accounted_secs, expired)
                    .await
                    .map(Some)
            }
        }
    }

    async fn evaluate_prepaid(
        &self,
        instance: &ContainerInstance,
        accrued: u64,
        accounted_secs: i64,
        expired: bool,
    ) -> Result<Evaluation> {
        // The lease debit lands right after RUNNING; until then only expiry applies.
        let prepaid = instance.tokens_debited;
        let debited = prepaid > 0;

        let (consumed, advance) = if debited {
            let consumed = instance
                .tokens_consumed
                .saturating_add(accrued)
                .min(prepaid)
                .max(instance.tokens_consumed);
            (consumed, accounted_secs)
        } else {
            (instance.tokens_consumed, 0)
        };

        // Exhaustion wins when both fire; both end the lease as EXPIRED.
        let flagged = if debited && consumed >= prepaid {
            Some(ReclaimReason::EntitlementExhausted)
        } else if expired {
            Some(ReclaimReason::Expired)
        } else {
            None
        };

        if consumed == instance.tokens_consumed && flagged.is_none() && advance == 0 {
            return Ok(Evaluation::default());
        }

        self.registry
            .transition(
                instance.id,
                Expect::exact(instance),
                InstanceStatus::Running,
                Box::new(move |i: &mut ContainerInstance| {
                    i.tokens_consumed = consumed;
                    i.last_metered_at += Duration::seconds(advance);
                    if let Some(reason) = flagged {
                        i.reclaim.get_or_insert(reason);
                    }
                }),
            )
            .await?;

        if let Some(reason) = flagged {
            info!(instance_id = %instance.id, ?reason, consumed, "Instance flagged for reclamation");
        }
        Ok(Evaluation {
            accrued: consumed - instance.tokens_consumed,
            flagged,
        })
    }

    async fn evaluate_metered(
        &self,
        instance: &ContainerInstance,
        accrued: u64,
        accounted_secs: i64,
        expired: bool,
    ) -> Result<Evaluation> {
        let mut evaluation = Evaluation::default();

        if accrued > 0 {
            // Claim the interval first so overlapping meters never bill it twice.
            let claimed = self
                .registry
                .transition(
                    instance.id,
                    Expect::exact(instance),
                    InstanceStatus::Running,
                    Box::new(move |i: &mut ContainerInstance| {
                        i.last_metered_at += Duration::seconds(accounted_secs);
                    }),
                )
                .await?;

            let reason = format!("usage {} ({})", instance.id, instance.template_id);
            match self.billing.debit(&instance.user_id, accrued, &reason).await {
                Ok(()) => {
                    self.record_usage(claimed.id, accrued).await?;
                    evaluation.accrued = accrued;
                }
                Err(e @ (BillingError::Unavailable(_) | BillingError::InvalidResponse(_))) => {
                    // Hand the interval back for the next tick.
                    warn!(instance_id = %instance.id, error = %e, "Billing unavailable, usage deferred");
                    let previous = instance.last_metered_at;
                    self.registry
                        .transition(
                            claimed.id,
                            Expect::exact(&claimed),
                            InstanceStatus::Running,
                            Box::new(move |i: &mut ContainerInstance| i.last_metered_at = previous),
                        )
                        .await?;
                    return Err(LeaseError::Billing(e.to_string()));
                }
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "Usage debit refused");
                    evaluation.flagged = Some(ReclaimReason::EntitlementExhausted);
                }
            }
        }

        if evaluation.flagged.is_none() && expired {
            evaluation.flagged = Some(ReclaimReason::Expired);
        }

        if let Some(reason) = evaluation.flagged {
            self.registry
                .transition(
                    instance.id,
                    Expect::status(InstanceStatus::Running),
                    InstanceStatus::Running,
                    Box::new(move |i: &mut ContainerInstance| {
                        i.reclaim.get_or_insert(reason);
                    }),
                )
                .await?;
            info!(instance_id = %instance.id, ?reason, "Instance flagged for reclamation");
        } else if accrued == 0 && accounted_secs > 0 {
            // Zero-rate template: keep the metering clock moving.
            self.registry
                .transition(
                    instance.id,
                    Expect::exact(instance),
                    InstanceStatus::Running,
                    Box::new(move |i: &mut ContainerInstance| {
                        i.last_metered_at += Duration::seconds(accounted_secs);
                    }),
                )
                .await?;
        }

        Ok(evaluation)
    }

    async fn record_usage(&self, id: InstanceId, tokens: u64) -> Result<()> {
        for status in [InstanceStatus::Running, InstanceStatus::Stopping] {
            let result = self
                .registry
                .transition(
                    id,
                    Expect::status(status),
                    status,
                    Box::new(move |i: &mut ContainerInstance| {
                        i.tokens_consumed = i.tokens_consumed.saturating_add(tokens);
                        i.tokens_debited = i.tokens_debited.saturating_add(tokens);
                    }),
                )
                .await;
            match result {
                Ok(_) => {
                    debug!(instance_id = %id, tokens, "Usage debited");
                    return Ok(());
                }
                Err(RegistryError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(LeaseError::Conflict(format!(
            "instance {id} ended before usage of {tokens} tokens was recorded"
        )))
    }
}
