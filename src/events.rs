//! Lifecycle events
//!
//! Provisioning-mode nodes announce themselves with `startup` lifecycle
//! events and registration messages. The listener turns both into fleet
//! admissions so nodes are picked up between discovery cycles. The
//! provisioner also publishes its own lifecycle events through an
//! [`EventPublisher`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fleet::Provisioner;
use crate::metrics::EVENT_DISCOVERED;
use crate::nats::messages::{lifecycle_subject, PROVISIONER_COMPONENT, REGISTRATION_SUBJECT};
use crate::nats::{LifecycleEvent, LifecycleKind, NatsClient, RegistrationData};
use crate::types::Result;

// =============================================================================
// Publishing
// =============================================================================

/// Destination for lifecycle events emitted by the provisioner
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn emit(&self, event: &LifecycleEvent) -> Result<()>;
}

#[async_trait]
impl EventPublisher for NatsClient {
    async fn emit(&self, event: &LifecycleEvent) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(event)?);
        self.publish(&event.subject(), payload).await
    }
}

/// Publisher that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn emit(&self, _event: &LifecycleEvent) -> Result<()> {
        Ok(())
    }
}

/// Announce that this provisioner instance started
pub async fn publish_startup(publisher: &dyn EventPublisher, identity: &str) {
    let event = LifecycleEvent::new(LifecycleKind::Startup, identity, PROVISIONER_COMPONENT)
        .with_version(env!("CARGO_PKG_VERSION"));

    match publisher.emit(&event).await {
        Ok(()) => debug!("Published startup event on {}", event.subject()),
        Err(e) => warn!("Could not publish startup event: {}", e),
    }
}

// =============================================================================
// Listening
// =============================================================================

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// `choria.lifecycle.event.startup.<component>`
    Lifecycle,
    /// `choria.provisioning_data`
    Registration,
}

impl EventSource {
    /// Subject to subscribe to for this source
    pub fn subject(&self, lifecycle_component: &str) -> String {
        match self {
            Self::Lifecycle => lifecycle_subject(LifecycleKind::Startup.as_str(), lifecycle_component),
            Self::Registration => REGISTRATION_SUBJECT.to_string(),
        }
    }
}

/// Identity of the node announced by `payload`, if it should be admitted
pub fn parse_event(source: EventSource, payload: &[u8]) -> Result<Option<String>> {
    let identity = match source {
        EventSource::Lifecycle => {
            let event: LifecycleEvent = serde_json::from_slice(payload)?;
            if event.kind() != Some(LifecycleKind::Startup) {
                return Ok(None);
            }
            event.identity
        }
        EventSource::Registration => serde_json::from_slice::<RegistrationData>(payload)?.identity,
    };

    if identity.is_empty() {
        return Ok(None);
    }

    Ok(Some(identity))
}

/// Admit nodes announced on `stream` until it ends or `cancel` fires
pub async fn run_listener<S>(
    mut stream: S,
    source: EventSource,
    provisioner: Arc<Provisioner>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Bytes> + Unpin + Send,
{
    info!(?source, "Listening for node events");

    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            payload = stream.next() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        let identity = match parse_event(source, &payload) {
            Ok(Some(identity)) => identity,
            Ok(None) => continue,
            Err(e) => {
                warn!(?source, "Ignoring invalid event: {}", e);
                continue;
            }
        };

        if provisioner.context().gate.paused() {
            warn!(identity = %identity, "Skipping event while paused");
            continue;
        }

        if provisioner.admit(&identity) {
            provisioner.context().observer.incr(EVENT_DISCOVERED, None);
        }
    }

    debug!(?source, "Event listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lifecycle() {
        let startup = serde_json::to_vec(&LifecycleEvent::new(
            LifecycleKind::Startup,
            "n1.example.net",
            "provision_mode_server",
        ))
        .unwrap();
        assert_eq!(
            parse_event(EventSource::Lifecycle, &startup).unwrap(),
            Some("n1.example.net".to_string())
        );

        let shutdown = serde_json::to_vec(&LifecycleEvent::new(
            LifecycleKind::Shutdown,
            "n1.example.net",
            "provision_mode_server",
        ))
        .unwrap();
        assert_eq!(parse_event(EventSource::Lifecycle, &shutdown).unwrap(), None);

        assert!(parse_event(EventSource::Lifecycle, b"nope").is_err());
    }

    #[test]
    fn test_parse_registration() {
        assert_eq!(
            parse_event(EventSource::Registration, br#"{"identity":"n2"}"#).unwrap(),
            Some("n2".to_string())
        );
        assert_eq!(
            parse_event(EventSource::Registration, br#"{"identity":""}"#).unwrap(),
            None
        );
    }

    #[test]
    fn test_source_subjects() {
        assert_eq!(
            EventSource::Lifecycle.subject("provision_mode_server"),
            "choria.lifecycle.event.startup.provision_mode_server"
        );
        assert_eq!(
            EventSource::Registration.subject("provision_mode_server"),
            "choria.provisioning_data"
        );
    }
}
