#![allow(dead_code)]

use agentbox_billing::InMemoryLedger;
use agentbox_common::{AgentTemplate, ContainerInstance, InstanceId, ResourceLimits, Tier};
use agentbox_manager::{
    InstanceRegistry, LeaseManager, ManagerConfig, MemoryRegistry, MemoryRuntime,
    ObjectSnapshotStore, RetryPolicy,
};
use std::collections::HashMap;
use std::sync::Arc;

pub const CODER: &str = "coder";
pub const WRITER: &str = "writer";

pub fn coder_template() -> AgentTemplate {
    AgentTemplate {
        id: CODER.into(),
        slug: "coder".into(),
        name: "Coder".into(),
        image: "ghcr.io/agentbox/coder:1".into(),
        port: 7681,
        tokens_per_hour: 60,
        required_tier: Tier::Developer,
        limits: ResourceLimits::default(),
        active: true,
        terminal_access: true,
        volume_path: "/workspace".into(),
        env: HashMap::from([("AGENT_MODE".to_string(), "coding".to_string())]),
    }
}

pub fn writer_template() -> AgentTemplate {
    AgentTemplate {
        id: WRITER.into(),
        slug: "writer".into(),
        name: "Writer".into(),
        image: "ghcr.io/agentbox/writer:1".into(),
        port: 8080,
        tokens_per_hour: 30,
        required_tier: Tier::Team,
        limits: ResourceLimits::default(),
        active: true,
        terminal_access: false,
        volume_path: "/home/agent".into(),
        env: HashMap::new(),
    }
}

pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        public_domain: "agents.test".into(),
        stop_timeout_secs: 0,
        step_timeout_secs: 1,
        provision_timeout_secs: 2,
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        templates: vec![coder_template(), writer_template()],
        ..Default::default()
    }
}

pub struct Harness {
    pub manager: Arc<LeaseManager>,
    pub registry: MemoryRegistry,
    pub runtime: MemoryRuntime,
    pub snapshots: ObjectSnapshotStore,
    pub ledger: InMemoryLedger,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let registry = MemoryRegistry::new();
        let runtime = MemoryRuntime::new();
        let snapshots = ObjectSnapshotStore::in_memory();
        let ledger = InMemoryLedger::new();
        let manager = Arc::new(LeaseManager::new(
            config,
            Arc::new(registry.clone()),
            Arc::new(runtime.clone()),
            Arc::new(snapshots.clone()),
            Arc::new(ledger.clone()),
        ));
        Self {
            manager,
            registry,
            runtime,
            snapshots,
            ledger,
        }
    }

    pub async fn account(&self, user_id: &str, tier: Tier, balance: u64) {
        self.ledger.create_account(user_id, tier, balance).await;
    }

    pub async fn instance(&self, id: InstanceId) -> ContainerInstance {
        self.registry
            .find(id)
            .await
            .expect("registry lookup")
            .expect("instance exists")
    }

    pub async fn handle(&self, id: InstanceId) -> String {
        self.instance(id)
            .await
            .runtime_handle
            .expect("instance has a runtime handle")
    }
}
