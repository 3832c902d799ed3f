use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;

use concordkv::multidc::replicator::Replicator;
use concordkv::multidc::replicator::ReplicatorEvent;
use concordkv::DcId;
use fixtures::ClusterSim;

mod fixtures;

/// Async replication delivers committed entries to the remote DC in order.
///
/// dc1 holds the single-voter Raft cluster (n1); dc2's n4 receives batches
/// out of band through the replicator. The acknowledged
/// `last_replicated_index` sequence never decreases, and dc2 ends with the
/// full key set.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_replication_preserves_order() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::two_dc_config();
    let sim = ClusterSim::new(config.clone());
    let n1 = sim.add_node("n1").await;
    let _n4 = sim.add_node("n4").await;

    sim.initialize_from(&"n1".into(), btreeset! {"n1".into()}).await?;
    sim.wait_for_metrics(
        &"n1".into(),
        |m| m.current_leader.is_some(),
        Duration::from_secs(5),
        "n1 leads dc1",
    )
    .await?;

    // Wire the replicator the way a primary-DC node does: commit path ->
    // bridge -> per-DC dispatcher.
    let replicator = Arc::new(Replicator::new(
        config.clone(),
        "dc1".into(),
        sim.network_from(&"n1".into()),
    ));
    replicator.start();
    let mut events = replicator.subscribe();
    let (bridge, _forwarder) = replicator.bridge();
    n1.dc_runtime.set_bridge(bridge);

    for (key, value) in [("alpha", "a"), ("beta", "b"), ("gamma", "c")] {
        sim.client_set(&"n1".into(), key, value).await.expect("write commits locally");
    }
    let leader_applied = n1.raft.metrics().borrow().last_applied;

    // Observe acknowledged indexes until dc2 has caught up fully.
    let mut acked = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Ok(ReplicatorEvent::BatchDelivered { dc, last_index })) => {
                assert_eq!(dc, DcId::new("dc2"));
                acked.push(last_index);
                if last_index >= leader_applied {
                    break;
                }
            }
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(!acked.is_empty(), "no batches were delivered");
    for window in acked.windows(2) {
        assert!(window[0] <= window[1], "acked indexes regressed: {acked:?}");
    }

    // Final state on dc2 matches the writes, in full.
    for (key, value) in [("alpha", "a"), ("beta", "b"), ("gamma", "c")] {
        assert_eq!(sim.get(&"n4".into(), key).await, Some(value.to_string()));
    }
    let status = replicator.get_status();
    let dc2 = status.get(&DcId::new("dc2")).expect("dc2 target");
    assert_eq!(dc2.last_replicated_index, leader_applied);
    assert!(dc2.is_healthy);

    let metrics = replicator.get_metrics();
    assert!(metrics.entries_replicated >= 3);

    replicator.stop().await;
    sim.shutdown().await;
    Ok(())
}
