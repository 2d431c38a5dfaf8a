//! Provisioning workers and the finisher
//!
//! A fixed number of workers drain the fleet's queue and run the state
//! machine. Every host a worker picked up is handed to the single finisher,
//! which removes it from the registry so it can be discovered afresh.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::Fleet;
use crate::host::{Host, HostContext};
use crate::metrics::{BUSY_WORKERS, PROVISIONED, PROVISION_ERRORS};

/// A host whose provisioning attempt has ended
#[derive(Debug)]
pub struct Finished {
    pub host: Arc<Host>,
    /// Keep the host registered for the finish delay. Set when the node was
    /// told to restart, shut down or upgrade, so that it is not rediscovered
    /// before it leaves provisioning mode.
    pub delay: bool,
}

/// Worker loop: provision queued hosts until cancelled
pub async fn worker_task(
    worker_id: usize,
    fleet: Arc<Fleet>,
    ctx: Arc<HostContext>,
    done: mpsc::Sender<Finished>,
    busy: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    debug!("Worker {} starting", worker_id);

    while let Some(host) = fleet.next(&cancel).await {
        if !fleet.is_current(&host) {
            debug!(identity = %host.identity(), "Worker {} dropping evicted node", worker_id);
            continue;
        }

        let now_busy = busy.fetch_add(1, Ordering::Relaxed) + 1;
        ctx.observer.set_gauge(BUSY_WORKERS, now_busy as f64);

        info!(identity = %host.identity(), "Worker {} provisioning node", worker_id);
        let result = host.provision(&ctx, &cancel).await;

        let now_busy = busy.fetch_sub(1, Ordering::Relaxed) - 1;
        ctx.observer.set_gauge(BUSY_WORKERS, now_busy as f64);

        let delay = match result {
            Ok(true) => {
                ctx.observer.incr(PROVISIONED, None);
                info!(identity = %host.identity(), "Provisioned node");
                true
            }
            Ok(false) => {
                info!(identity = %host.identity(), "Node is upgrading, it will be provisioned after it restarts");
                true
            }
            Err(e) if e.is_deferred() => {
                info!(identity = %host.identity(), "Provisioning deferred: {}", e);
                false
            }
            Err(e) if e.is_paused() || e.is_cancelled() => {
                info!(identity = %host.identity(), "Provisioning interrupted: {}", e);
                false
            }
            Err(e) => {
                ctx.observer.incr(PROVISION_ERRORS, None);
                error!(identity = %host.identity(), "Provisioning failed: {}", e);
                false
            }
        };

        if done.send(Finished { host, delay }).await.is_err() {
            break;
        }
    }

    debug!("Worker {} stopped", worker_id);
}

/// Remove finished hosts from the registry, after `delay` where requested
pub async fn finisher_task(
    fleet: Arc<Fleet>,
    mut done: mpsc::Receiver<Finished>,
    delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        let finished = tokio::select! {
            _ = cancel.cancelled() => break,
            finished = done.recv() => match finished {
                Some(finished) => finished,
                None => break,
            },
        };

        if !finished.delay || delay.is_zero() {
            fleet.remove(&finished.host);
            continue;
        }

        let fleet = fleet.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => fleet.remove(&finished.host),
            }
        });
    }

    debug!("Finisher stopped");
}
