//! Choria Provisioner - bootstraps fleet nodes booted into provisioning mode

use clap::Parser;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use provisioner::{
    agent::NatsAgentClient,
    config::{Args, ProvisionerConfig},
    discovery::BroadcastDiscoverer,
    election::{KvElectionBackend, LeaderElection, ELECTION_NAME},
    events::{self, EventSource},
    fleet::Provisioner,
    host::{helper::ExecHelper, HostContext},
    metrics::FleetMetrics,
    nats::NatsClient,
    pause::PauseGate,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "choria_provisioner={level},provisioner={level},info",
            level = args.log_level
        )
        .into()
    });
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = match ProvisionerConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Could not load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(pid) = &args.pid {
        std::fs::write(pid, std::process::id().to_string())?;
    }

    info!("======================================");
    info!("  Choria Provisioner {}", env!("CARGO_PKG_VERSION"));
    info!("======================================");
    info!("Identity: {}", args.identity);
    info!("Config: {}", config.file.display());
    info!("NATS: {}", args.nats.nats_url);
    info!("Workers: {}", config.workers);
    info!("Interval: {:?}", config.interval_duration);
    info!("Helper: {}", config.helper);
    info!(
        "Features: pki={} jwt={} ed25519={} upgrades={}",
        config.features.pki, config.features.jwt, config.features.ed25519, config.features.version_upgrades
    );
    info!("Leader election: {}", config.leader_election);
    info!("======================================");

    let nats = match NatsClient::new(&args.nats, &args.identity).await {
        Ok(client) => client,
        Err(e) => {
            error!("NATS connection failed: {}", e);
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(FleetMetrics::new(config.site.clone()));
    let gate = Arc::new(PauseGate::new(metrics.clone()));
    let config = Arc::new(config);

    let agent = NatsAgentClient::new(nats.clone(), &args.identity, config.rpc_timeout_duration);
    let helper = ExecHelper::new(&config.helper, config.helper_timeout_duration);
    let discoverer =
        BroadcastDiscoverer::new(nats.clone(), &args.identity, config.discovery_timeout_duration);

    let ctx = HostContext::new(
        config.clone(),
        gate.clone(),
        metrics.clone(),
        Arc::new(agent),
        Arc::new(helper),
    )
    .with_events(Arc::new(nats.clone()));

    let provisioner = Arc::new(Provisioner::new(ctx, Arc::new(discoverer)));
    let cancel = CancellationToken::new();

    events::publish_startup(&nats, &args.identity).await;

    for source in [EventSource::Lifecycle, EventSource::Registration] {
        let subject = source.subject(&config.lifecycle_component);
        let subscriber = nats.subscribe(&subject).await?;
        info!("Listening for {:?} events on {}", source, subject);
        tokio::spawn(events::run_listener(
            subscriber.map(|msg| msg.payload),
            source,
            provisioner.clone(),
            cancel.clone(),
        ));
    }

    if config.leader_election {
        let backend = KvElectionBackend::new(&nats, config.election_ttl_duration).await?;
        let election = LeaderElection::new(
            Arc::new(backend),
            ELECTION_NAME,
            &args.identity,
            config.election_ttl_duration,
        );
        let won = provisioner.clone();
        let lost = provisioner.clone();
        let election_cancel = cancel.clone();
        tokio::spawn(async move {
            election
                .run(
                    election_cancel,
                    move || won.leadership_won(),
                    move || lost.leadership_lost(),
                )
                .await
        });
    }

    #[cfg(unix)]
    {
        let gate = gate.clone();
        let cancel = cancel.clone();
        let mut usr1 = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = usr1.recv() => {
                        let paused = gate.flip();
                        warn!("Received SIGUSR1, provisioning is now {}", if paused { "paused" } else { "running" });
                    }
                }
            }
        });
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not listen for shutdown signal: {}", e);
        }
        info!("Shutting down");
        shutdown.cancel();
    });

    provisioner.run(cancel).await?;

    if let Err(e) = nats.flush().await {
        warn!("Could not flush pending messages: {}", e);
    }

    match serde_json::to_string(&metrics.snapshot()) {
        Ok(snapshot) => info!("Final metrics: {}", snapshot),
        Err(e) => warn!("Could not render metrics: {}", e),
    }

    if let Some(pid) = &args.pid {
        let _ = std::fs::remove_file(pid);
    }

    Ok(())
}
