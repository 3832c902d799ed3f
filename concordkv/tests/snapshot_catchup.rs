use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;

use concordkv::config::Config;
use concordkv::config::SnapshotPolicy;
use fixtures::ClusterSim;

mod fixtures;

/// A follower that falls behind the retained log catches up through a
/// snapshot install.
///
/// - three nodes, n3 partitioned away;
/// - the leader commits enough entries to cross the snapshot threshold and
///   purge the covered log;
/// - once n3 is restored, its replication stream has to fall back to
///   InstallSnapshot, after which n3 converges on the full state.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_follower_catches_up_via_snapshot() -> Result<()> {
    fixtures::init_tracing();

    let config = std::sync::Arc::new(
        Config::build("sim-snap")
            .election_timeout_min(100)
            .election_timeout_max(200)
            .heartbeat_interval(30)
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(10))
            .validate()?,
    );
    let sim = ClusterSim::new(config);
    for id in ["n1", "n2", "n3"] {
        sim.add_node(id).await;
    }
    sim.initialize_from(&"n1".into(), btreeset! {"n1".into(), "n2".into(), "n3".into()})
        .await?;
    let leader = sim.wait_for_leader(Duration::from_secs(5)).await?;
    let lagger = sim
        .node_ids()
        .await
        .into_iter()
        .find(|id| id != &leader)
        .expect("cluster has followers");

    sim.isolate_node(&lagger).await;

    // Enough committed entries to trigger compaction at least twice.
    for i in 0..30 {
        sim.client_set(&leader, &format!("key-{i}"), &format!("value-{i}"))
            .await
            .expect("write with two-node quorum");
    }

    let leader_metrics = sim
        .wait_for_metrics(
            &leader,
            |m| m.snapshot.index > 0,
            Duration::from_secs(5),
            "leader compacts its log",
        )
        .await?;
    assert!(leader_metrics.snapshot.index >= 10);

    // Restore the lagger: it is now behind the earliest retained entry.
    sim.restore_node(&lagger).await;
    let applied_target = leader_metrics.last_applied;
    let lagger_metrics = sim
        .wait_for_metrics(
            &lagger,
            |m| m.last_applied >= applied_target,
            Duration::from_secs(10),
            "lagger converges via snapshot",
        )
        .await?;
    assert!(
        lagger_metrics.snapshot.index > 0,
        "the lagging follower should have installed a snapshot"
    );

    for i in [0, 15, 29] {
        assert_eq!(
            sim.get(&lagger, &format!("key-{i}")).await,
            Some(format!("value-{i}")),
        );
    }

    sim.shutdown().await;
    Ok(())
}
