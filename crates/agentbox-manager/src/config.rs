use agentbox_common::AgentTemplate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// How leases are charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingMode {
    /// The whole lease is debited once the sandbox is running; the meter only
    /// accrues consumption against that prepaid amount.
    #[default]
    Prepaid,
    /// Nothing up front; the meter debits `rate × elapsed` on every tick.
    Metered,
}

/// Bounded retry with exponential backoff for runtime and store steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Explicit configuration handed to every component at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Instances are reachable at `https://<subdomain>.<public_domain>`.
    pub public_domain: String,
    pub max_lease_hours: u32,
    pub max_active_total: usize,
    pub max_active_per_user: usize,
    pub billing_mode: BillingMode,
    pub reap_interval_secs: u64,
    pub meter_interval_secs: u64,
    /// Grace period for a graceful stop before the sandbox is force-killed.
    pub stop_timeout_secs: u64,
    /// Upper bound for each export/upload/remove attempt.
    pub step_timeout_secs: u64,
    /// Upper bound for each create-and-start attempt.
    pub provision_timeout_secs: u64,
    pub provisioning_stale_after_secs: u64,
    pub stopping_stale_after_secs: u64,
    pub reap_concurrency: usize,
    pub download_url_ttl_secs: u64,
    pub retry: RetryPolicy,
    pub templates: Vec<AgentTemplate>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            public_domain: "agents.localhost".to_string(),
            max_lease_hours: 72,
            max_active_total: 64,
            max_active_per_user: 4,
            billing_mode: BillingMode::Prepaid,
            reap_interval_secs: 30,
            meter_interval_secs: 60,
            stop_timeout_secs: 10,
            step_timeout_secs: 60,
            provision_timeout_secs: 120,
            provisioning_stale_after_secs: 600,
            stopping_stale_after_secs: 900,
            reap_concurrency: 8,
            download_url_ttl_secs: 900,
            retry: RetryPolicy::default(),
            templates: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::from_yaml_str(&content)?;
        info!(
            path = %path.display(),
            templates = config.templates.len(),
            "Loaded manager configuration"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.public_domain.trim().is_empty() {
            return Err(ConfigError::Invalid("public_domain must not be empty".into()));
        }
        if self.max_lease_hours == 0 {
            return Err(ConfigError::Invalid("max_lease_hours must be positive".into()));
        }
        if self.reap_interval_secs == 0 || self.meter_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep intervals must be positive".into()));
        }
        if self.reap_concurrency == 0 {
            return Err(ConfigError::Invalid("reap_concurrency must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        let budget = self.teardown_budget();
        if Duration::from_secs(self.stopping_stale_after_secs) <= budget {
            return Err(ConfigError::Invalid(format!(
                "stopping_stale_after_secs ({}) must exceed the worst-case teardown time ({}s)",
                self.stopping_stale_after_secs,
                budget.as_secs_f64().ceil()
            )));
        }
        let budget = self.launch_budget();
        if Duration::from_secs(self.provisioning_stale_after_secs) <= budget {
            return Err(ConfigError::Invalid(format!(
                "provisioning_stale_after_secs ({}) must exceed the worst-case launch time ({}s)",
                self.provisioning_stale_after_secs,
                budget.as_secs_f64().ceil()
            )));
        }

        let mut ids = HashSet::new();
        let mut slugs = HashSet::new();
        for template in &self.templates {
            if !ids.insert(template.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate template id {}",
                    template.id
                )));
            }
            if !slugs.insert(template.slug.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate template slug {}",
                    template.slug
                )));
            }
            if !is_dns_label(&template.slug) {
                return Err(ConfigError::Invalid(format!(
                    "template slug {:?} is not a valid DNS label",
                    template.slug
                )));
            }
            if !template.volume_path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "template {} volume_path must be absolute",
                    template.id
                )));
            }
        }
        Ok(())
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn meter_interval(&self) -> Duration {
        Duration::from_secs(self.meter_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Longest one teardown can run: inspect, graceful stop, then retried
    /// kill, export, upload and remove.
    pub fn teardown_budget(&self) -> Duration {
        let step = self.step_timeout();
        step + self.stop_timeout() + step + self.retried(step) * 4
    }

    /// Longest one launch can run: retried snapshot fetch, then retried
    /// create and start.
    pub fn launch_budget(&self) -> Duration {
        self.retried(self.step_timeout()) + self.retried(self.provision_timeout())
    }

    /// Every attempt of a retried step timing out, plus the backoff between them.
    fn retried(&self, timeout: Duration) -> Duration {
        let attempts = self.retry.max_attempts.max(1);
        let backoff: Duration = (1..attempts).map(|a| self.retry.backoff(a)).sum();
        timeout * attempts + backoff
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn provisioning_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.provisioning_stale_after_secs))
    }

    pub fn stopping_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.stopping_stale_after_secs))
    }

    pub fn download_url_ttl(&self) -> Duration {
        Duration::from_secs(self.download_url_ttl_secs)
    }
}

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1_000)
}

// Subdomains are `<slug>-<suffix>`, so the slug leaves room for the suffix.
fn is_dns_label(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 50
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Read-only lookup of agent templates by id.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: HashMap<String, AgentTemplate>,
}

impl TemplateCatalog {
    pub fn new(templates: impl IntoIterator<Item = AgentTemplate>) -> Self {
        Self {
            templates: templates
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
        }
    }

    pub fn get(&self, template_id: &str) -> Option<&AgentTemplate> {
        self.templates.get(template_id)
    }

    /// Active templates sorted by id.
    pub fn active(&self) -> Vec<AgentTemplate> {
        let mut active: Vec<_> = self
            .templates
            .values()
            .filter(|t| t.active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
public_domain: agents.example.com
max_active_per_user: 2
billing_mode: metered
stopping_stale_after_secs: 1800
provisioning_stale_after_secs: 1200
retry:
  max_attempts: 5
templates:
  - id: coder
    slug: coder
    name: Coder
    image: ghcr.io/agentbox/coder:1.2
    port: 7681
    tokens_per_hour: 60
    required_tier: team
    terminal_access: true
    limits:
      memory_bytes: 1073741824
      cpu_shares: 1024
      pid_limit: 512
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = ManagerConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.public_domain, "agents.example.com");
        assert_eq!(config.max_active_per_user, 2);
        assert_eq!(config.billing_mode, BillingMode::Metered);
        assert_eq!(config.retry.max_attempts, 5);
        // Unspecified fields keep their defaults
        assert_eq!(config.retry.initial_backoff_ms, 200);
        assert_eq!(config.reap_interval_secs, 30);

        let catalog = TemplateCatalog::new(config.templates.clone());
        let coder = catalog.get("coder").unwrap();
        assert_eq!(coder.limits.pid_limit, 512);
        assert!(coder.terminal_access);
    }

    #[test]
    fn test_rejects_duplicate_template_ids() {
        let yaml = r#"
templates:
  - {id: a, slug: a, name: A, image: "x", port: 1, tokens_per_hour: 1}
  - {id: a, slug: b, name: B, image: "y", port: 1, tokens_per_hour: 1}
"#;
        assert!(matches!(
            ManagerConfig::from_yaml_str(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_bad_slug() {
        let yaml = r#"
templates:
  - {id: a, slug: "Not_A_Label", name: A, image: "x", port: 1, tokens_per_hour: 1}
"#;
        assert!(ManagerConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_default_teardown_fits_stale_threshold() {
        let config = ManagerConfig::default();
        // 60s inspect, 10s grace + 60s, then four steps of 3 x 60s plus 600ms backoff.
        assert_eq!(config.teardown_budget(), Duration::from_millis(852_400));
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_stale_threshold_inside_teardown() {
        for stale in [0, 300, 852] {
            let yaml = format!("stopping_stale_after_secs: {stale}\n");
            assert!(
                matches!(ManagerConfig::from_yaml_str(&yaml), Err(ConfigError::Invalid(_))),
                "{stale}s should be rejected"
            );
        }

        let yaml = "stopping_stale_after_secs: 900\nretry:\n  max_attempts: 5\n";
        assert!(ManagerConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_default_launch_fits_stale_threshold() {
        let config = ManagerConfig::default();
        // 3 x 60s fetch and 3 x 120s launch, each with 600ms of backoff.
        assert_eq!(config.launch_budget(), Duration::from_millis(541_200));
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_provisioning_threshold_inside_launch() {
        for stale in [0, 120, 541] {
            let yaml = format!("provisioning_stale_after_secs: {stale}\n");
            assert!(
                matches!(ManagerConfig::from_yaml_str(&yaml), Err(ConfigError::Invalid(_))),
                "{stale}s should be rejected"
            );
        }

        let yaml = "provisioning_stale_after_secs: 600\nprovision_timeout_secs: 300\n";
        assert!(ManagerConfig::from_yaml_str(yaml).is_err());
        assert!(ManagerConfig::from_yaml_str("provisioning_stale_after_secs: 542\n").is_ok());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(9), Duration::from_millis(1_000));
    }

    #[test]
    fn test_active_templates_skip_inactive() {
        let mut config = ManagerConfig::from_yaml_str(SAMPLE).unwrap();
        let mut retired = config.templates[0].clone();
        retired.id = "retired".into();
        retired.slug = "retired".into();
        retired.active = false;
        config.templates.push(retired);

        let catalog = TemplateCatalog::new(config.templates);
        let active = catalog.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "coder");
    }

    #[tokio::test]
    async fn test_shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/agentbox.yaml");
        let config = ManagerConfig::load(&path).await.unwrap();
        assert_eq!(config.billing_mode, BillingMode::Prepaid);
        assert_eq!(TemplateCatalog::new(config.templates).active().len(), 2);
    }
}
