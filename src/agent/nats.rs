//! Agent RPC over NATS

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AgentClient;
use crate::nats::messages::{node_subject, PROVISIONING_COLLECTIVE};
use crate::nats::{Collect, NatsClient, RequestFilter, RpcReply, RpcRequest};
use crate::types::Result;

/// [`AgentClient`] that sends node-directed requests through NATS
#[derive(Clone)]
pub struct NatsAgentClient {
    client: NatsClient,
    caller: String,
    collective: String,
    timeout: Duration,
}

impl NatsAgentClient {
    pub fn new(client: NatsClient, caller: &str, timeout: Duration) -> Self {
        Self {
            client,
            caller: caller.to_string(),
            collective: PROVISIONING_COLLECTIVE.to_string(),
            timeout,
        }
    }
}

fn sender_of(payload: &Bytes) -> Option<String> {
    serde_json::from_slice::<RpcReply>(payload)
        .ok()
        .map(|r| r.sender)
}

#[async_trait]
impl AgentClient for NatsAgentClient {
    async fn call(
        &self,
        identity: &str,
        agent: &str,
        action: &str,
        data: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<Vec<RpcReply>> {
        let request = RpcRequest::new(agent, action, data)
            .with_caller(&self.caller)
            .with_collective(&self.collective)
            .with_filter(RequestFilter {
                identity: vec![identity.to_string()],
                ..Default::default()
            });

        debug!(identity = %identity, request_id = %request.request_id, "Calling {}#{}", agent, action);

        let payload = Bytes::from(serde_json::to_vec(&request)?);
        let raw = self
            .client
            .scatter(
                &node_subject(&self.collective, identity),
                payload,
                self.timeout,
                Collect::UntilDeadline,
                cancel,
                |reply| sender_of(reply).as_deref() == Some(identity),
            )
            .await?;

        let mut replies = Vec::with_capacity(raw.len());
        for payload in raw {
            match serde_json::from_slice::<RpcReply>(&payload) {
                Ok(reply) => replies.push(reply),
                Err(e) => warn!(identity = %identity, "Ignoring undecodable reply to {}#{}: {}", agent, action, e),
            }
        }

        Ok(replies)
    }
}
