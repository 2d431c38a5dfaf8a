//! Registry of tracked hosts and the work queue feeding the workers

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use flume::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::host::Host;
use crate::metrics::{Observer, WAITING_NODES, WORK_QUEUE_ENTRIES};
use crate::types::{ProvisionerError, Result};

/// Work queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 50_000;

/// Hosts being provisioned, keyed by identity, plus the bounded queue of
/// hosts waiting for a worker.
///
/// A host is admitted at most once per discovery interval. Queue entries
/// may outlive their registry entry (after [`Fleet::remove_all`]); workers
/// use [`Fleet::is_current`] to skip them.
pub struct Fleet {
    hosts: Mutex<HashMap<String, Arc<Host>>>,
    sender: flume::Sender<Arc<Host>>,
    receiver: flume::Receiver<Arc<Host>>,
    interval: Duration,
    capacity: usize,
    observer: Arc<dyn Observer>,
}

impl Fleet {
    pub fn with_capacity(interval: Duration, capacity: usize, observer: Arc<dyn Observer>) -> Self {
        let (sender, receiver) = flume::bounded(capacity.max(1));
        Self {
            hosts: Mutex::new(HashMap::new()),
            sender,
            receiver,
            interval,
            capacity: capacity.max(1),
            observer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Host>>> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_gauges(&self, hosts: &HashMap<String, Arc<Host>>) {
        self.observer.set_gauge(WAITING_NODES, hosts.len() as f64);
        self.observer
            .set_gauge(WORK_QUEUE_ENTRIES, self.queue_len() as f64);
    }

    /// Admit `host` and queue it for provisioning.
    ///
    /// Returns `Ok(false)` when a host with the same identity was admitted
    /// less than one interval ago. Older entries are replaced. A full queue
    /// leaves the registry unchanged and fails with
    /// [`ProvisionerError::Capacity`].
    pub fn add(&self, host: Arc<Host>) -> Result<bool> {
        let mut hosts = self.lock();
        let identity = host.identity().to_string();

        if let Some(existing) = hosts.get(&identity) {
            let age = existing.age();
            if age < self.interval {
                debug!(identity = %identity, ?age, "Node is already being provisioned");
                return Ok(false);
            }

            info!(identity = %identity, ?age, "Replacing stale entry");
            hosts.remove(&identity);
        }

        hosts.insert(identity.clone(), host.clone());

        let result = match self.sender.try_send(host) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                hosts.remove(&identity);
                Err(ProvisionerError::Capacity(self.capacity))
            }
            Err(TrySendError::Disconnected(_)) => {
                hosts.remove(&identity);
                Err(ProvisionerError::Internal("work queue is closed".into()))
            }
        };

        self.update_gauges(&hosts);
        result
    }

    /// True while the registry still tracks this very host
    pub fn is_current(&self, host: &Arc<Host>) -> bool {
        self.lock()
            .get(host.identity())
            .map(|h| Arc::ptr_eq(h, host))
            .unwrap_or(false)
    }

    /// Stop tracking `host`. A newer host with the same identity is kept.
    pub fn remove(&self, host: &Arc<Host>) {
        let mut hosts = self.lock();
        if hosts
            .get(host.identity())
            .map(|h| Arc::ptr_eq(h, host))
            .unwrap_or(false)
        {
            hosts.remove(host.identity());
            debug!(identity = %host.identity(), "Removed node from the registry");
        }
        self.update_gauges(&hosts);
    }

    /// Forget every host and drain whatever is queued
    pub fn remove_all(&self) {
        let mut hosts = self.lock();
        let tracked = hosts.len();
        hosts.clear();

        let drained = self.receiver.drain().count();

        info!(tracked, drained, "Removed all nodes");
        self.update_gauges(&hosts);
    }

    /// Wait for the next queued host, None once cancelled
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Arc<Host>> {
        let host = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            host = self.receiver.recv_async() => host.ok(),
        };

        self.observer
            .set_gauge(WORK_QUEUE_ENTRIES, self.queue_len() as f64);
        host
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.lock().contains_key(identity)
    }

    /// Number of tracked hosts
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of hosts waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
