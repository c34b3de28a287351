use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerConfigError {
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Memory,
}

/// Process-level settings, read from the environment by the binary only.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// YAML `ManagerConfig`; built-in defaults when unset.
    pub config_path: Option<PathBuf>,
    pub runtime: RuntimeKind,
    /// `memory://`, `file:///path` or `s3://bucket/prefix`.
    pub snapshot_url: String,
    /// Remote billing service; an in-process ledger when unset.
    pub billing_url: Option<url::Url>,
    /// Registry state file; in-memory only when unset.
    pub state_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            config_path: None,
            runtime: RuntimeKind::Docker,
            snapshot_url: "memory://".to_string(),
            billing_url: None,
            state_file: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ServerConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ServerConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("AGENTBOX_HOST") {
            config.host = value.parse().map_err(|e: std::net::AddrParseError| {
                invalid("AGENTBOX_HOST", &value, e.to_string())
            })?;
        }
        if let Some(value) = lookup("AGENTBOX_PORT") {
            config.port = value.parse().map_err(|e: std::num::ParseIntError| {
                invalid("AGENTBOX_PORT", &value, e.to_string())
            })?;
        }
        config.config_path = lookup("AGENTBOX_CONFIG").map(PathBuf::from);
        if let Some(value) = lookup("AGENTBOX_RUNTIME") {
            config.runtime = match value.as_str() {
                "docker" => RuntimeKind::Docker,
                "memory" => RuntimeKind::Memory,
                _ => {
                    return Err(invalid(
                        "AGENTBOX_RUNTIME",
                        &value,
                        "expected docker or memory".into(),
                    ))
                }
            };
        }
        if let Some(value) = lookup("AGENTBOX_SNAPSHOT_URL") {
            config.snapshot_url = value;
        }
        if let Some(value) = lookup("AGENTBOX_BILLING_URL") {
            config.billing_url = Some(value.parse().map_err(|e: url::ParseError| {
                invalid("AGENTBOX_BILLING_URL", &value, e.to_string())
            })?);
        }
        config.state_file = lookup("AGENTBOX_STATE_FILE").map(PathBuf::from);

        Ok(config)
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn invalid(name: &'static str, value: &str, reason: String) -> ServerConfigError {
    ServerConfigError::Invalid {
        name,
        value: value.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.addr().to_string(), "0.0.0.0:8080");
        assert_eq!(config.runtime, RuntimeKind::Docker);
        assert_eq!(config.snapshot_url, "memory://");
        assert!(config.billing_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("AGENTBOX_HOST", "127.0.0.1"),
            ("AGENTBOX_PORT", "9000"),
            ("AGENTBOX_RUNTIME", "memory"),
            ("AGENTBOX_BILLING_URL", "http://billing.internal:8000/"),
            ("AGENTBOX_STATE_FILE", "/var/lib/agentbox/registry.json"),
        ]))
        .unwrap();
        assert_eq!(config.addr().to_string(), "127.0.0.1:9000");
        assert_eq!(config.runtime, RuntimeKind::Memory);
        assert_eq!(
            config.billing_url.unwrap().as_str(),
            "http://billing.internal:8000/"
        );
        assert_eq!(
            config.state_file,
            Some(PathBuf::from("/var/lib/agentbox/registry.json"))
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ServerConfig::from_lookup(lookup(&[("AGENTBOX_PORT", "eighty")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("AGENTBOX_RUNTIME", "firecracker")])).is_err());
    }
}
