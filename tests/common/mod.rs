//! Fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use provisioner::agent::AgentClient;
use provisioner::config::ProvisionerConfig;
use provisioner::discovery::Discoverer;
use provisioner::events::EventPublisher;
use provisioner::host::helper::{ConfigHelper, HelperResponse};
use provisioner::host::HostContext;
use provisioner::metrics::FleetMetrics;
use provisioner::nats::{LifecycleEvent, RpcReply};
use provisioner::pause::PauseGate;
use provisioner::Result;

/// Agent that answers with canned replies per action and records calls
#[derive(Default)]
pub struct FakeAgent {
    replies: HashMap<String, Value>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeAgent {
    /// Agent whose nodes accept configure, restart and shutdown
    pub fn cooperative() -> Self {
        let mut replies = HashMap::new();
        replies.insert("inventory".to_string(), json!({"facts": {"os": "linux"}, "version": "0.28.0"}));
        replies.insert("configure".to_string(), json!({"message": "configured"}));
        replies.insert("restart".to_string(), json!({"message": "restarting"}));
        replies.insert("shutdown".to_string(), json!({"message": "shutting down"}));
        Self {
            replies,
            ..Default::default()
        }
    }

    /// (identity, action) pairs in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn actions_for(&self, identity: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| id == identity)
            .map(|(_, action)| action)
            .collect()
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn call(
        &self,
        identity: &str,
        _agent: &str,
        action: &str,
        _data: Value,
        _cancel: &CancellationToken,
    ) -> Result<Vec<RpcReply>> {
        self.calls
            .lock()
            .unwrap()
            .push((identity.to_string(), action.to_string()));

        Ok(self
            .replies
            .get(action)
            .map(|reply| vec![RpcReply::ok(identity, reply.clone())])
            .unwrap_or_default())
    }
}

/// Helper answering per identity from the JSON input, with a fallback
pub struct FakeHelper {
    by_identity: HashMap<String, HelperResponse>,
    fallback: HelperResponse,
}

impl FakeHelper {
    pub fn new(fallback: HelperResponse) -> Self {
        Self {
            by_identity: HashMap::new(),
            fallback,
        }
    }

    pub fn with(mut self, identity: &str, response: HelperResponse) -> Self {
        self.by_identity.insert(identity.to_string(), response);
        self
    }
}

#[async_trait]
impl ConfigHelper for FakeHelper {
    fn name(&self) -> &str {
        "fake-helper"
    }

    async fn resolve(&self, input: &str, _cancel: &CancellationToken) -> Result<HelperResponse> {
        let state: Value = serde_json::from_str(input)?;
        let identity = state["identity"].as_str().unwrap_or_default();
        Ok(self
            .by_identity
            .get(identity)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Discoverer returning a fixed list
pub struct FixedDiscoverer(pub Vec<String>);

#[async_trait]
impl Discoverer for FixedDiscoverer {
    async fn discover(&self, _cancel: &CancellationToken) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Publisher remembering every event
#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<LifecycleEvent>>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn emit(&self, event: &LifecycleEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub fn configured() -> HelperResponse {
    let mut configuration = HashMap::new();
    configuration.insert("plugin.choria.srv_domain".to_string(), "example.net".to_string());
    HelperResponse {
        configuration,
        ..Default::default()
    }
}

pub fn deferred(msg: &str) -> HelperResponse {
    HelperResponse {
        defer: true,
        msg: msg.to_string(),
        ..Default::default()
    }
}

pub fn config(leader_election: bool) -> ProvisionerConfig {
    let mut config = ProvisionerConfig {
        helper: "/usr/local/bin/helper".into(),
        token: "s3cret".into(),
        workers: 2,
        finish_delay: "50ms".into(),
        leader_election,
        ..Default::default()
    };
    config.finalize().unwrap();
    config
}

pub fn context(
    config: ProvisionerConfig,
    agent: Arc<FakeAgent>,
    helper: FakeHelper,
) -> (HostContext, Arc<FleetMetrics>) {
    let metrics = Arc::new(FleetMetrics::new("test"));
    let ctx = HostContext::new(
        Arc::new(config),
        Arc::new(PauseGate::new(metrics.clone())),
        metrics.clone(),
        agent,
        Arc::new(helper),
    )
    .with_retry_base(Duration::from_millis(1));
    (ctx, metrics)
}

/// Poll `check` until it holds or two seconds passed
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
