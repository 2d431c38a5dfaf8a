//! Typed `choria_provision` actions for a single node

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use super::HostContext;
use crate::agent::{CsrReply, Ed25519Reply, InventoryReply, JwtReply, MessageReply};
use crate::nats::messages::PROVISION_AGENT;
use crate::nats::RpcReply;
use crate::retry::retry;
use crate::types::{ProvisionerError, Result};

/// Agent carrying node inventory
pub const RPCUTIL_AGENT: &str = "rpcutil";

/// Payload of `choria_provision#configure`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigureRequest {
    /// JSON encoded configuration map
    pub configuration: String,
    pub ca: String,
    pub certificate: String,
    pub key: String,
    pub ssldir: String,
    /// Ephemeral public key used to encrypt `key`
    pub ecdh_public: String,
    pub action_policies: HashMap<String, String>,
    pub opa_policies: HashMap<String, String>,
    pub server_jwt: String,
}

/// Client for the actions of one node, attaching the provisioning token
/// to every request
pub struct ProvisionAgent<'a> {
    ctx: &'a HostContext,
    identity: &'a str,
    cancel: &'a CancellationToken,
}

/// Exactly one successful reply from `identity` is acceptable
pub(crate) fn single_reply(action: &str, identity: &str, replies: Vec<RpcReply>) -> Result<RpcReply> {
    if replies.len() != 1 {
        return Err(ProvisionerError::Rpc(format!(
            "could not {}: received {} responses while expecting a response from {}",
            action,
            replies.len(),
            identity
        )));
    }

    let mut replies = replies;
    let reply = replies.remove(0);
    if !reply.is_ok() {
        return Err(ProvisionerError::Rpc(format!(
            "invalid response from {}: {} ({})",
            reply.sender, reply.statusmsg, reply.statuscode
        )));
    }

    Ok(reply)
}

fn with_token(token: &str, data: Value) -> Value {
    let mut data = match data {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    data.insert("token".into(), Value::String(token.to_string()));
    Value::Object(data)
}

fn decode<T: DeserializeOwned>(agent: &str, action: &str, identity: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| {
        ProvisionerError::Rpc(format!(
            "could not decode {}#{} reply from {}: {}",
            agent, action, identity, e
        ))
    })
}

impl<'a> ProvisionAgent<'a> {
    pub fn new(ctx: &'a HostContext, identity: &'a str, cancel: &'a CancellationToken) -> Self {
        Self {
            ctx,
            identity,
            cancel,
        }
    }

    async fn invoke<T: DeserializeOwned>(
        &self,
        agent: &str,
        action: &str,
        tries: u32,
        data: Value,
    ) -> Result<T> {
        let data = self.invoke_raw(agent, action, tries, data).await?;
        decode(agent, action, self.identity, data)
    }

    /// Run `agent#action` and return the reply data undecoded
    async fn invoke_raw(&self, agent: &str, action: &str, tries: u32, data: Value) -> Result<Value> {
        let label = format!("{}#{}", agent, action);
        let data = with_token(&self.ctx.config.token, data);
        let identity = self.identity;
        let client = &self.ctx.agent;
        let data = &data;

        let reply = retry(
            &self.ctx.gate,
            &*self.ctx.observer,
            self.cancel,
            &label,
            &self.ctx.policy(tries),
            move |cancel| async move {
                let replies = client
                    .call(identity, agent, action, data.clone(), &cancel)
                    .await?;
                single_reply(action, identity, replies)
            },
        )
        .await?;

        Ok(reply.data)
    }

    pub async fn jwt(&self) -> Result<JwtReply> {
        self.invoke(PROVISION_AGENT, "jwt", 3, json!({})).await
    }

    pub async fn gen25519(&self, nonce: &str) -> Result<Ed25519Reply> {
        self.invoke(PROVISION_AGENT, "gen25519", 5, json!({ "nonce": nonce }))
            .await
    }

    /// Inventory with the complete reply data kept as JSON text in `json`
    pub async fn inventory(&self) -> Result<InventoryReply> {
        let data = self.invoke_raw(RPCUTIL_AGENT, "inventory", 5, json!({})).await?;
        let json = serde_json::to_string(&data).map_err(|e| {
            ProvisionerError::Rpc(format!("could not obtain inventory JSON data: {}", e))
        })?;

        let mut reply: InventoryReply = decode(RPCUTIL_AGENT, "inventory", self.identity, data)?;
        reply.json = json;
        Ok(reply)
    }

    pub async fn gencsr(&self, cn: &str) -> Result<CsrReply> {
        self.invoke(PROVISION_AGENT, "gencsr", 1, json!({ "cn": cn }))
            .await
    }

    pub async fn configure(&self, request: &ConfigureRequest) -> Result<MessageReply> {
        self.invoke(PROVISION_AGENT, "configure", 5, serde_json::to_value(request)?)
            .await
    }

    pub async fn restart(&self) -> Result<MessageReply> {
        self.invoke(PROVISION_AGENT, "restart", 3, json!({ "splay": 1 }))
            .await
    }

    pub async fn shutdown(&self) -> Result<MessageReply> {
        self.invoke(PROVISION_AGENT, "shutdown", 3, json!({})).await
    }

    pub async fn release_update(&self, repository: &str, version: &str) -> Result<MessageReply> {
        self.invoke(
            PROVISION_AGENT,
            "release_update",
            3,
            json!({ "repo": repository, "version": version }),
        )
        .await
    }
}
