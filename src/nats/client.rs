//! NATS client wrapper
//!
//! Connection management plus the two messaging patterns the provisioner
//! needs beyond plain publish/subscribe: scatter-gather requests that collect
//! any number of replies on a private inbox until a deadline, and a sliding
//! window variant used for broadcast discovery.

use async_nats::{Client, ConnectOptions};
use bytes::Bytes;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::NatsArgs;
use crate::types::{ProvisionerError, Result};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// How replies to a scatter-gather request are collected
#[derive(Debug, Clone, Copy)]
pub enum Collect {
    /// Stop at the deadline or once the caller reports the set complete
    UntilDeadline,
    /// Stop at the deadline or when no reply arrived for `window`
    SlidingWindow(Duration),
}

/// NATS client wrapper
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect using the CLI arguments
    pub async fn new(args: &NatsArgs, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", args.nats_url);

        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| ProvisionerError::Nats(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);

        Ok(Self { client })
    }

    /// Get the underlying NATS client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Publish a message to a subject
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| ProvisionerError::Nats(format!("Publish failed: {}", e)))
    }

    /// Subscribe to a subject
    pub async fn subscribe(&self, subject: &str) -> Result<async_nats::Subscriber> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| ProvisionerError::Nats(format!("Subscribe failed: {}", e)))
    }

    /// Publish `payload` to `subject` and gather replies on a fresh inbox.
    ///
    /// `done` is consulted after each reply; returning true ends collection
    /// early. The deadline and `cancel` always end it.
    pub async fn scatter<F>(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
        collect: Collect,
        cancel: &CancellationToken,
        mut done: F,
    ) -> Result<Vec<Bytes>>
    where
        F: FnMut(&Bytes) -> bool,
    {
        let inbox = self.client.new_inbox();
        let mut replies = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| ProvisionerError::Nats(format!("Subscribe failed: {}", e)))?;

        self.client
            .publish_with_reply(subject.to_string(), inbox, payload)
            .await
            .map_err(|e| ProvisionerError::Nats(format!("Publish failed: {}", e)))?;

        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();

        loop {
            let wake = match collect {
                Collect::SlidingWindow(window) if !collected.is_empty() => {
                    (Instant::now() + window).min(deadline)
                }
                _ => deadline,
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ProvisionerError::Cancelled(format!("request to {}", subject)));
                }
                _ = tokio::time::sleep_until(wake) => break,
                msg = replies.next() => match msg {
                    Some(msg) => {
                        let finished = done(&msg.payload);
                        collected.push(msg.payload);
                        if finished {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        debug!(subject = %subject, replies = collected.len(), "Collected replies");

        let _ = replies.unsubscribe().await;

        Ok(collected)
    }

    /// Flush pending messages
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| ProvisionerError::Nats(format!("Flush failed: {}", e)))
    }
}
