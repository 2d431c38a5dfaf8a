//! Leader election between provisioner instances
//!
//! Leadership is a key in a JetStream key-value bucket whose entries expire
//! after the election TTL. The leader keeps renewing the key with an
//! optimistic revision check; everybody else keeps trying to create it.
//! Whoever holds the key drives the fleet.

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::nats::NatsClient;
use crate::types::{ProvisionerError, Result};

/// Bucket holding election keys
pub const ELECTION_BUCKET: &str = "CHORIA_LEADER_ELECTION";

/// Key contested by provisioner instances
pub const ELECTION_NAME: &str = "provisioner";

const MAX_CAMPAIGN_INTERVAL: Duration = Duration::from_secs(20);

/// Storage for election state
#[async_trait]
pub trait ElectionBackend: Send + Sync {
    /// Try to take leadership of `name`, returning the held revision when won
    async fn campaign(&self, name: &str, identity: &str) -> Result<Option<u64>>;

    /// Extend leadership held at `revision`, returning the new revision
    async fn renew(&self, name: &str, identity: &str, revision: u64) -> Result<u64>;
}

/// [`ElectionBackend`] on a JetStream key-value bucket
pub struct KvElectionBackend {
    store: kv::Store,
}

impl KvElectionBackend {
    /// Open the election bucket, creating it with `ttl` expiry if needed
    pub async fn new(client: &NatsClient, ttl: Duration) -> Result<Self> {
        let js = jetstream::new(client.inner().clone());

        let store = match js.get_key_value(ELECTION_BUCKET).await {
            Ok(store) => store,
            Err(_) => js
                .create_key_value(kv::Config {
                    bucket: ELECTION_BUCKET.to_string(),
                    history: 1,
                    max_age: ttl,
                    storage: jetstream::stream::StorageType::Memory,
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    ProvisionerError::Nats(format!("Failed to create election bucket: {}", e))
                })?,
        };

        info!("Using bucket {} for leader election", ELECTION_BUCKET);
        Ok(Self { store })
    }
}

#[async_trait]
impl ElectionBackend for KvElectionBackend {
    async fn campaign(&self, name: &str, identity: &str) -> Result<Option<u64>> {
        match self
            .store
            .create(name, Bytes::from(identity.to_string()))
            .await
        {
            Ok(revision) => Ok(Some(revision)),
            Err(e) if matches!(e.kind(), kv::CreateErrorKind::AlreadyExists) => Ok(None),
            Err(e) => Err(ProvisionerError::Nats(format!("Campaign failed: {}", e))),
        }
    }

    async fn renew(&self, name: &str, identity: &str, revision: u64) -> Result<u64> {
        self.store
            .update(name, Bytes::from(identity.to_string()), revision)
            .await
            .map_err(|e| ProvisionerError::Nats(format!("Renewing leadership failed: {}", e)))
    }
}

/// Campaign driver reporting leadership changes
pub struct LeaderElection {
    backend: Arc<dyn ElectionBackend>,
    name: String,
    identity: String,
    interval: Duration,
}

impl LeaderElection {
    pub fn new(backend: Arc<dyn ElectionBackend>, name: &str, identity: &str, ttl: Duration) -> Self {
        Self {
            backend,
            name: name.to_string(),
            identity: identity.to_string(),
            interval: (ttl / 2).min(MAX_CAMPAIGN_INTERVAL).max(Duration::from_millis(10)),
        }
    }

    /// Time between campaigns and renewals
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One campaign or renewal round given the currently held revision
    pub async fn step<W, L>(&self, held: Option<u64>, on_won: &W, on_lost: &L) -> Option<u64>
    where
        W: Fn() + Send + Sync,
        L: Fn() + Send + Sync,
    {
        match held {
            Some(revision) => match self.backend.renew(&self.name, &self.identity, revision).await {
                Ok(revision) => Some(revision),
                Err(e) => {
                    warn!(election = %self.name, "Lost leadership: {}", e);
                    on_lost();
                    None
                }
            },
            None => match self.backend.campaign(&self.name, &self.identity).await {
                Ok(Some(revision)) => {
                    info!(election = %self.name, "Became leader");
                    on_won();
                    Some(revision)
                }
                Ok(None) => {
                    debug!(election = %self.name, "Another instance is leading");
                    None
                }
                Err(e) => {
                    warn!(election = %self.name, "Campaign failed: {}", e);
                    None
                }
            },
        }
    }

    /// Campaign until cancelled. `on_won` and `on_lost` fire on transitions only.
    pub async fn run<W, L>(&self, cancel: CancellationToken, on_won: W, on_lost: L)
    where
        W: Fn() + Send + Sync,
        L: Fn() + Send + Sync,
    {
        info!(election = %self.name, interval = ?self.interval, "Campaigning for leadership");

        let mut ticker = tokio::time::interval(self.interval);
        let mut held = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            held = self.step(held, &on_won, &on_lost).await;
        }

        debug!(election = %self.name, "Election stopped");
    }
}
