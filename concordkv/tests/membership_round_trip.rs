use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;

use concordkv::Role;
use fixtures::ClusterSim;

mod fixtures;

/// Adding then removing a server leaves the membership identical to its
/// prior value, and the joining node replicates while it is a member.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_remove_server_is_identity() -> Result<()> {
    fixtures::init_tracing();

    let sim = ClusterSim::new(fixtures::single_dc_config());
    let n1 = sim.add_node("n1").await;
    sim.initialize_from(&"n1".into(), btreeset! {"n1".into()}).await?;
    sim.wait_for_metrics(
        &"n1".into(),
        |m| m.role == Role::Leader,
        Duration::from_secs(5),
        "n1 leads",
    )
    .await?;

    sim.client_set(&"n1".into(), "k1", "v1").await.expect("seed write");
    let before = n1.raft.metrics().borrow().membership.clone();

    // Add n2: the change resolves once the config entry commits under the
    // two-node quorum, which requires n2 to have caught up.
    sim.add_node("n2").await;
    n1.raft.add_server("n2".into()).await.expect("add_server");
    let grown = n1.raft.metrics().borrow().membership.clone();
    assert!(grown.is_voter(&"n2".into()));
    sim.wait_for_metrics(
        &"n2".into(),
        |m| m.last_applied >= 2,
        Duration::from_secs(5),
        "n2 catches up",
    )
    .await?;
    assert_eq!(sim.get(&"n2".into(), "k1").await, Some("v1".to_string()));

    // Remove n2: back to the original configuration, byte for byte.
    n1.raft.remove_server("n2".into()).await.expect("remove_server");
    let after = n1.raft.metrics().borrow().membership.clone();
    assert_eq!(after, before);

    // The cluster still commits with the restored single-node quorum.
    sim.client_set(&"n1".into(), "k2", "v2").await.expect("post-removal write");
    assert_eq!(sim.get(&"n1".into(), "k2").await, Some("v2".to_string()));

    sim.shutdown().await;
    Ok(())
}
