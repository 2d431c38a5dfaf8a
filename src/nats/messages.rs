//! Wire messages exchanged with nodes over NATS
//!
//! Covers the RPC envelope sent to provisioning-mode agents, their replies,
//! and the lifecycle events both published and consumed by the provisioner.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Collective that provisioning-mode nodes join
pub const PROVISIONING_COLLECTIVE: &str = "provisioning";

/// Agent every provisioning-mode node exposes
pub const PROVISION_AGENT: &str = "choria_provision";

/// Subject on which provisioning-mode nodes publish registration data
pub const REGISTRATION_SUBJECT: &str = "choria.provisioning_data";

/// Lifecycle component used for events published by the provisioner
pub const PROVISIONER_COMPONENT: &str = "provisioner";

/// Subject for a node-directed request
pub fn node_subject(collective: &str, identity: &str) -> String {
    format!("{}.node.{}", collective, identity)
}

/// Subject for a broadcast request to every node running `agent`
pub fn broadcast_subject(collective: &str, agent: &str) -> String {
    format!("{}.broadcast.agent.{}", collective, agent)
}

/// Subject for lifecycle events of `kind` emitted by `component`
pub fn lifecycle_subject(kind: &str, component: &str) -> String {
    format!("choria.lifecycle.event.{}.{}", kind, component)
}

/// Restricts which nodes act on a broadcast request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identity: Vec<String>,
}

/// RPC request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Unique request ID
    pub request_id: String,
    pub agent: String,
    pub action: String,
    pub collective: String,
    /// Identity of the provisioner making the call
    pub caller: String,
    #[serde(default)]
    pub filter: RequestFilter,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RpcRequest {
    /// Create a new request with a generated ID
    pub fn new(agent: &str, action: &str, data: serde_json::Value) -> Self {
        Self {
            request_id: Uuid::new_v4().simple().to_string(),
            agent: agent.to_string(),
            action: action.to_string(),
            collective: PROVISIONING_COLLECTIVE.to_string(),
            caller: String::new(),
            filter: RequestFilter::default(),
            data,
        }
    }

    pub fn with_caller(mut self, caller: &str) -> Self {
        self.caller = caller.to_string();
        self
    }

    pub fn with_collective(mut self, collective: &str) -> Self {
        self.collective = collective.to_string();
        self
    }

    pub fn with_filter(mut self, filter: RequestFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Status code for a successful action
pub const STATUS_OK: i64 = 0;

/// Reply from a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    /// Identity of the replying node
    pub sender: String,
    #[serde(default)]
    pub statuscode: i64,
    #[serde(default)]
    pub statusmsg: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RpcReply {
    pub fn ok(sender: &str, data: serde_json::Value) -> Self {
        Self {
            sender: sender.to_string(),
            statuscode: STATUS_OK,
            statusmsg: "OK".to_string(),
            data,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.statuscode == STATUS_OK
    }
}

/// Kinds of lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Startup,
    Shutdown,
    Provisioned,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Provisioned => "provisioned",
        }
    }

    fn from_protocol(protocol: &str) -> Option<Self> {
        match protocol.rsplit('.').next()? {
            "startup" => Some(Self::Startup),
            "shutdown" => Some(Self::Shutdown),
            "provisioned" => Some(Self::Provisioned),
            _ => None,
        }
    }
}

/// A Choria style lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// e.g. `io.choria.lifecycle.v1.startup`
    pub protocol: String,
    pub identity: String,
    pub component: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl LifecycleEvent {
    pub fn new(kind: LifecycleKind, identity: &str, component: &str) -> Self {
        Self {
            protocol: format!("io.choria.lifecycle.v1.{}", kind.as_str()),
            identity: identity.to_string(),
            component: component.to_string(),
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// The event kind, None for kinds the provisioner does not know
    pub fn kind(&self) -> Option<LifecycleKind> {
        LifecycleKind::from_protocol(&self.protocol)
    }

    /// Subject this event is published on
    pub fn subject(&self) -> String {
        let kind = self.protocol.rsplit('.').next().unwrap_or("unknown");
        lifecycle_subject(kind, &self.component)
    }
}

/// Registration data published by provisioning-mode nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationData {
    pub identity: String,
}
