//! Fleet orchestration
//!
//! [`Provisioner`] owns the registry and work queue ([`Fleet`]), the worker
//! pool, the finisher and the discovery loop. Discovery and event listeners
//! admit hosts, workers provision them, and the finisher forgets them so
//! that they can be found again.

pub mod registry;
pub mod worker;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::Discoverer;
use crate::host::{Host, HostContext};
use crate::metrics::{DISCOVERED, DISCOVERY_ERRORS, DISCOVER_CYCLES};
use crate::types::{ProvisionerError, Result};

pub use registry::{Fleet, DEFAULT_QUEUE_CAPACITY};
pub use worker::Finished;

/// The provisioning orchestrator
pub struct Provisioner {
    ctx: Arc<HostContext>,
    fleet: Arc<Fleet>,
    discoverer: Arc<dyn Discoverer>,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl Provisioner {
    /// Build the orchestrator. With leader election enabled the pause gate
    /// is closed until leadership is won.
    pub fn new(ctx: HostContext, discoverer: Arc<dyn Discoverer>) -> Self {
        Self::with_queue_capacity(ctx, discoverer, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(
        ctx: HostContext,
        discoverer: Arc<dyn Discoverer>,
        capacity: usize,
    ) -> Self {
        let fleet = Arc::new(Fleet::with_capacity(
            ctx.config.interval_duration,
            capacity,
            ctx.observer.clone(),
        ));

        if ctx.config.leader_election {
            info!("Pausing until leadership is won");
            ctx.gate.pause();
        }

        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        Self {
            ctx: Arc::new(ctx),
            fleet,
            discoverer,
            trigger_tx,
            trigger_rx: tokio::sync::Mutex::new(trigger_rx),
        }
    }

    pub fn context(&self) -> &Arc<HostContext> {
        &self.ctx
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    /// Request an immediate discovery; coalesces with a pending request
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Leadership was won: resume and discover right away
    pub fn leadership_won(&self) {
        info!("Became leader, resuming provisioning");
        self.ctx.gate.resume();
        self.trigger();
    }

    /// Leadership was lost: pause and forget every tracked node
    pub fn leadership_lost(&self) {
        warn!("Lost leadership, pausing and clearing all nodes");
        self.ctx.gate.pause();
        self.fleet.remove_all();
    }

    /// Admit a node by identity, true when it was queued
    pub fn admit(&self, identity: &str) -> bool {
        match self.fleet.add(Arc::new(Host::new(identity))) {
            Ok(added) => {
                if added {
                    debug!(identity = %identity, "Admitted node");
                }
                added
            }
            Err(e @ ProvisionerError::Capacity(_)) => {
                warn!(identity = %identity, "Could not admit node: {}", e);
                false
            }
            Err(e) => {
                error!(identity = %identity, "Could not admit node: {}", e);
                false
            }
        }
    }

    /// Run one discovery cycle, returning how many nodes were admitted
    pub async fn discover_once(&self, cancel: &CancellationToken) -> Result<usize> {
        if self.ctx.gate.paused() {
            debug!("Skipping discovery while paused");
            return Ok(0);
        }

        self.ctx.observer.incr(DISCOVER_CYCLES, None);

        let found = match self.discoverer.discover(cancel).await {
            Ok(found) => found,
            Err(e) => {
                self.ctx.observer.incr(DISCOVERY_ERRORS, None);
                return Err(e);
            }
        };

        let mut admitted = 0;
        for identity in &found {
            if self.admit(identity) {
                self.ctx.observer.incr(DISCOVERED, None);
                admitted += 1;
            }
        }

        info!(found = found.len(), admitted, "Discovery cycle complete");
        Ok(admitted)
    }

    /// Discover at startup, on every interval tick and on every trigger
    async fn discovery_loop(&self, cancel: CancellationToken) {
        let mut triggers = self.trigger_rx.lock().await;
        let mut ticker = tokio::time::interval(self.ctx.config.interval_duration);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                Some(()) = triggers.recv() => {
                    debug!("Discovery triggered");
                }
            }

            if let Err(e) = self.discover_once(&cancel).await {
                if !e.is_cancelled() {
                    error!("Discovery failed: {}", e);
                }
            }
        }

        debug!("Discovery loop stopped");
    }

    /// Run workers, finisher and discovery until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let workers = self.ctx.config.workers.max(1);
        let (done_tx, done_rx) = mpsc::channel(workers * 2);
        let busy = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        info!(
            workers,
            interval = ?self.ctx.config.interval_duration,
            "Starting provisioner"
        );

        for i in 0..workers {
            tasks.spawn(worker::worker_task(
                i,
                self.fleet.clone(),
                self.ctx.clone(),
                done_tx.clone(),
                busy.clone(),
                cancel.clone(),
            ));
        }
        drop(done_tx);

        tasks.spawn(worker::finisher_task(
            self.fleet.clone(),
            done_rx,
            self.ctx.config.finish_delay_duration,
            cancel.clone(),
        ));

        let discovery = self.clone();
        let discovery_cancel = cancel.clone();
        tasks.spawn(async move { discovery.discovery_loop(discovery_cancel).await });

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("Provisioner task failed: {}", e);
            }
        }

        info!("Provisioner stopped");
        Ok(())
    }
}
