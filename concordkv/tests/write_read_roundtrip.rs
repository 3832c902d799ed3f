use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;

use concordkv::error::WriteError;
use fixtures::ClusterSim;

mod fixtures;

/// Basic write/read round trip on a three-node cluster.
///
/// - forms a cluster of n1..n3 and waits for a leader;
/// - writes k1=v1 through the leader and reads it back from every node's
///   applied state;
/// - confirms the leader's linearizable read guard passes and that a
///   follower redirects writes with a leader hint.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_read_round_trip() -> Result<()> {
    fixtures::init_tracing();

    let sim = ClusterSim::new(fixtures::single_dc_config());
    for id in ["n1", "n2", "n3"] {
        sim.add_node(id).await;
    }
    sim.initialize_from(&"n1".into(), btreeset! {"n1".into(), "n2".into(), "n3".into()})
        .await?;
    let leader = sim.wait_for_leader(Duration::from_secs(5)).await?;

    let response = sim.client_set(&leader, "k1", "v1").await.expect("write should commit");
    assert!(response.index >= 1);

    for id in sim.node_ids().await {
        sim.wait_for_metrics(
            &id,
            |m| m.last_applied >= response.index,
            Duration::from_secs(5),
            &format!("{id} applies k1"),
        )
        .await?;
        assert_eq!(sim.get(&id, "k1").await, Some("v1".to_string()));
    }

    // The leader can still prove leadership against a quorum.
    let leader_handle = sim.handle(&leader).await.expect("leader handle");
    leader_handle.raft.client_read().await.expect("read guard");

    // A follower redirects writes toward the leader.
    let follower = sim
        .node_ids()
        .await
        .into_iter()
        .find(|id| id != &leader)
        .expect("cluster has followers");
    match sim.client_set(&follower, "k2", "v2").await {
        Err(WriteError::ForwardToLeader(hint)) => assert_eq!(hint, Some(leader.clone())),
        other => panic!("expected leader redirect, got {other:?}"),
    }

    sim.shutdown().await;
    Ok(())
}
