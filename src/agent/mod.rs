//! Provisioning agent RPC
//!
//! Nodes in provisioning mode run a small `choria_provision` agent. The
//! [`AgentClient`] trait is the single seam through which the provisioner
//! reaches it; [`NatsAgentClient`] is the production transport and tests
//! substitute scripted fakes.

pub mod nats;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::nats::RpcReply;
use crate::types::Result;

pub use self::nats::NatsAgentClient;

/// Transport for agent actions addressed to a single node
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Invoke `agent#action` on `identity` and return every reply received
    /// before the transport gave up waiting.
    async fn call(
        &self,
        identity: &str,
        agent: &str,
        action: &str,
        data: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<Vec<RpcReply>>;
}

/// Reply to `choria_provision#jwt`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwtReply {
    #[serde(default)]
    pub jwt: String,
    /// Node's X25519 public key, hex encoded
    #[serde(default)]
    pub ecdh_public: String,
}

/// Reply to `choria_provision#gen25519`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ed25519Reply {
    #[serde(default)]
    pub public_key: String,
    /// Signature over the request nonce, hex encoded
    #[serde(default)]
    pub signature: String,
    /// Directory the key pair was written to on the node
    #[serde(default)]
    pub directory: String,
}

/// Reply to `choria_provision#gencsr`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrReply {
    #[serde(default)]
    pub csr: String,
    #[serde(default)]
    pub ssldir: String,
}

/// Reply to `rpcutil#inventory`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryReply {
    #[serde(default)]
    pub facts: serde_json::Value,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub upgradable: bool,
    /// The complete reply data as JSON text
    #[serde(skip)]
    pub json: String,
}

/// Reply to actions that only acknowledge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageReply {
    #[serde(default)]
    pub message: String,
}
