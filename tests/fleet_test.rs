//! Admission control and leadership hand-over

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{config, configured, context, FakeAgent, FakeHelper, FixedDiscoverer};
use provisioner::fleet::{Fleet, Provisioner};
use provisioner::host::Host;
use provisioner::metrics::NoopObserver;
use provisioner::ProvisionerError;

fn fleet() -> Fleet {
    Fleet::with_capacity(Duration::from_secs(60), 100, Arc::new(NoopObserver))
}

#[tokio::test]
async fn test_second_add_within_interval_is_rejected() {
    let fleet = fleet();
    for id in ["a", "b", "c"] {
        assert!(fleet.add(Arc::new(Host::new(id))).unwrap());
    }
    for id in ["a", "b", "c"] {
        assert!(!fleet.add(Arc::new(Host::new(id))).unwrap());
    }
    assert_eq!(fleet.len(), 3);
    assert_eq!(fleet.queue_len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_readmission_after_eviction_and_interval() {
    let fleet = fleet();
    let first = Arc::new(Host::new("a"));
    assert!(fleet.add(first.clone()).unwrap());

    fleet.remove_all();
    tokio::time::advance(Duration::from_secs(60)).await;

    assert!(fleet.add(Arc::new(Host::new("a"))).unwrap());
    assert!(!fleet.is_current(&first));
}

#[tokio::test]
async fn test_full_queue_reports_capacity() {
    let fleet = Fleet::with_capacity(Duration::from_secs(60), 2, Arc::new(NoopObserver));
    fleet.add(Arc::new(Host::new("a"))).unwrap();
    fleet.add(Arc::new(Host::new("b"))).unwrap();

    match fleet.add(Arc::new(Host::new("c"))) {
        Err(ProvisionerError::Capacity(2)) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(fleet.len(), 2);
}

#[tokio::test]
async fn test_remove_all_invalidates_dequeued_hosts() {
    let fleet = fleet();
    let host = Arc::new(Host::new("a"));
    fleet.add(host.clone()).unwrap();

    // a worker snapshot taken before the eviction
    let cancel = CancellationToken::new();
    let dequeued = fleet.next(&cancel).await.unwrap();
    assert!(fleet.is_current(&dequeued));

    fleet.remove_all();
    assert!(!fleet.is_current(&dequeued));
    assert!(fleet.is_empty());
}

#[tokio::test]
async fn test_leadership_loss_mid_cycle() {
    let agent = Arc::new(FakeAgent::cooperative());
    let (ctx, _) = context(config(true), agent.clone(), FakeHelper::new(configured()));
    let nodes: Vec<String> = (0..20).map(|i| format!("n{}.example.net", i)).collect();
    let provisioner = Provisioner::new(ctx, Arc::new(FixedDiscoverer(nodes)));
    let cancel = CancellationToken::new();

    // not leader yet: nothing is discovered
    assert_eq!(provisioner.discover_once(&cancel).await.unwrap(), 0);

    provisioner.leadership_won();
    assert_eq!(provisioner.discover_once(&cancel).await.unwrap(), 20);
    assert_eq!(provisioner.fleet().queue_len(), 20);

    provisioner.leadership_lost();
    assert!(provisioner.fleet().is_empty());
    assert_eq!(provisioner.fleet().queue_len(), 0);
    assert!(provisioner.context().gate.paused());

    // discovery stays quiet until leadership returns
    assert_eq!(provisioner.discover_once(&cancel).await.unwrap(), 0);
    assert!(agent.calls().is_empty());
}
