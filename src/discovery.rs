//! Discovery of nodes in provisioning mode

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::nats::messages::{broadcast_subject, PROVISIONING_COLLECTIVE, PROVISION_AGENT};
use crate::nats::{Collect, NatsClient, RequestFilter, RpcReply, RpcRequest};
use crate::types::Result;

/// Agent answering broadcast discovery requests
pub const DISCOVERY_AGENT: &str = "discovery";

/// Time to wait for further replies once the first arrived
pub const DISCOVERY_WINDOW: Duration = Duration::from_millis(300);

/// Finds identities of nodes that can be provisioned
#[async_trait]
pub trait Discoverer: Send + Sync {
    async fn discover(&self, cancel: &CancellationToken) -> Result<Vec<String>>;
}

/// Broadcast discovery of nodes running the provisioning agent
#[derive(Clone)]
pub struct BroadcastDiscoverer {
    client: NatsClient,
    caller: String,
    timeout: Duration,
}

impl BroadcastDiscoverer {
    pub fn new(client: NatsClient, caller: &str, timeout: Duration) -> Self {
        Self {
            client,
            caller: caller.to_string(),
            timeout,
        }
    }
}

fn identities(replies: &[Bytes]) -> Vec<String> {
    let mut found = BTreeSet::new();

    for reply in replies {
        match serde_json::from_slice::<RpcReply>(reply) {
            Ok(s) if !s.sender.is_empty() => {
                found.insert(s.sender);
            }
            Ok(_) => {}
            Err(e) => warn!("Ignoring undecodable discovery reply: {}", e),
        }
    }

    found.into_iter().collect()
}

#[async_trait]
impl Discoverer for BroadcastDiscoverer {
    async fn discover(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let request = RpcRequest::new(DISCOVERY_AGENT, "ping", serde_json::json!({}))
            .with_caller(&self.caller)
            .with_filter(RequestFilter {
                agent: vec![PROVISION_AGENT.to_string()],
                ..Default::default()
            });

        let raw = self
            .client
            .scatter(
                &broadcast_subject(PROVISIONING_COLLECTIVE, DISCOVERY_AGENT),
                Bytes::from(serde_json::to_vec(&request)?),
                self.timeout,
                Collect::SlidingWindow(DISCOVERY_WINDOW),
                cancel,
                |_| false,
            )
            .await?;

        let found = identities(&raw);
        debug!("Discovered {} nodes from {} replies", found.len(), raw.len());

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities_are_unique_and_sorted() {
        let replies: Vec<Bytes> = [
            r#"{"sender":"n2","statuscode":0,"data":{}}"#,
            r#"{"sender":"n1","statuscode":0,"data":{}}"#,
            r#"{"sender":"n2","statuscode":0,"data":{}}"#,
            r#"{"sender":"","statuscode":0}"#,
            "garbage",
        ]
        .iter()
        .map(|s| Bytes::from(s.to_string()))
        .collect();

        assert_eq!(identities(&replies), vec!["n1", "n2"]);
    }
}
