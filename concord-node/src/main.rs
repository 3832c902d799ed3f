//! The ConcordKV node binary.
//!
//! Usage: `concord-node <config.json>`. The config file names this node, its
//! peers and the DC layout; a node in a multi-DC layout additionally runs
//! the async replicator, and the topology-hosting node runs the topology
//! service plus the failure-detection/recovery/failover stack.
//!
//! Exit codes: 0 on clean shutdown, non-zero on startup failure.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use tracing::error;
use tracing::info;
use tracing_subscriber::prelude::*;

use concordkv::config::Config;
use concordkv::config::DataCenter;
use concordkv::config::Server;
use concordkv::dc::DcRuntime;
use concordkv::dc::DcView;
use concordkv::error::InitializeError;
use concordkv::multidc::replicator::Replicator;
use concordkv::raft::RaftNode;
use concordkv::topology::HashRange;
use concordkv::topology::NodeHealth;
use concordkv::topology::NodeStatus;
use concordkv::topology::ShardInfo;
use concordkv::topology::ShardState;
use concordkv::topology::TopologyService;
use concordkv::NodeId;

use concord_node::coordination::CoordinationStack;
use concord_node::http;
use concord_node::http::NodeContext;
use concord_node::net::HttpNetwork;
use concord_node::MemKv;
use concord_node::MemLog;

/// On-disk node configuration.
#[derive(Debug, Deserialize)]
struct NodeFile {
    cluster_name: String,
    node_id: String,
    /// Address the HTTP API binds to.
    listen_addr: String,
    /// Host the topology service and coordination stack on this node.
    #[serde(default)]
    host_topology: bool,
    /// Bootstrap voter set; applied only on a pristine node containing
    /// this node's id.
    #[serde(default)]
    initialize: Vec<String>,
    /// Shards created by the topology host on first boot.
    #[serde(default = "default_shard_count")]
    shard_count: usize,
    #[serde(default)]
    datacenters: Vec<DataCenter>,
    servers: Vec<Server>,
}

fn default_shard_count() -> usize {
    1
}

fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!(error = %err, "node failed to start");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .context("usage: concord-node <config.json>")?;
    let raw = std::fs::read(&path).with_context(|| format!("cannot read config file {path}"))?;
    let file: NodeFile = serde_json::from_slice(&raw).context("malformed config file")?;

    let node_id = NodeId::new(file.node_id.clone());
    let listen_addr: SocketAddr = file
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", file.listen_addr))?;

    let mut builder = Config::build(file.cluster_name.clone());
    for dc in &file.datacenters {
        builder = builder.datacenter(dc.clone());
    }
    for server in &file.servers {
        builder = builder.server(server.clone());
    }
    let config = Arc::new(builder.validate().context("invalid configuration")?);

    let store = Arc::new(MemKv::new());
    let log = Arc::new(MemLog::new());
    let network = Arc::new(HttpNetwork::from_config(&config));

    let multi_dc = !config.datacenters.is_empty();
    let dc_runtime = if multi_dc {
        let view = DcView::from_config(&config, &node_id)?;
        Arc::new(DcRuntime::new(view, &config))
    } else {
        DcRuntime::single_dc(node_id.clone())
    };
    let local_dc = dc_runtime.view.local_dc().clone();

    let raft = RaftNode::new(
        node_id.clone(),
        config.clone(),
        dc_runtime.clone(),
        network.clone(),
        log.clone(),
        store.clone(),
    );

    if !file.initialize.is_empty() && file.initialize.contains(&file.node_id) {
        let members: BTreeSet<NodeId> = file.initialize.iter().map(NodeId::new).collect();
        match raft.initialize(members).await {
            // NotAllowed simply means the cluster is already formed.
            Ok(()) | Err(InitializeError::NotAllowed) => {}
            Err(err) => return Err(err.into()),
        }
    }

    // Cross-DC replication runs wherever remote DCs exist; committed entries
    // reach it through the DC runtime's bridge.
    let replicator = if multi_dc && !config.remote_dcs(&local_dc).is_empty() {
        let replicator = Arc::new(Replicator::new(
            config.clone(),
            local_dc.clone(),
            network.clone(),
        ));
        replicator.start();
        let (bridge, _forwarder) = replicator.bridge();
        dc_runtime.set_bridge(bridge);
        Some(replicator)
    } else {
        None
    };

    // Cross-DC latency sampling feeds the router and detector.
    if multi_dc {
        let view = Arc::new(dc_runtime.view.clone());
        let _sampler = dc_runtime.latency.clone().spawn_sampler(
            view,
            network.clone(),
            std::time::Duration::from_millis(config.detector.probe_interval.max(1)),
        );
    }

    let topology = if file.host_topology {
        let topology = Arc::new(TopologyService::from_config(&config));
        seed_shards(&topology, &config, file.shard_count);
        Some(topology)
    } else {
        None
    };

    let mut coordination = match (&topology, &replicator) {
        (Some(topology), Some(replicator)) => Some(CoordinationStack::start(
            &config,
            local_dc.clone(),
            network.clone(),
            replicator.clone(),
            topology.clone(),
            log.clone(),
            store.clone(),
            raft.metrics(),
        )),
        _ => None,
    };

    let ctx = Arc::new(NodeContext {
        node_id: node_id.clone(),
        raft: raft.clone(),
        store,
        log,
        network,
        replicator: replicator.clone(),
        topology,
    });

    info!(node = %node_id, dc = %local_dc, %listen_addr, "concord node starting");

    tokio::select! {
        served = http::serve(ctx, listen_addr) => {
            // Startup failures (port conflicts) land here.
            served?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    if let Some(coordination) = coordination.as_mut() {
        coordination.shutdown();
    }
    if let Some(replicator) = replicator {
        replicator.stop().await;
    }
    raft.shutdown().await?;
    info!("clean shutdown");
    Ok(())
}

/// First-boot shard map: even hash ranges, primaries rotated through the
/// primary DC's nodes, remote async replicas attached to every shard.
fn seed_shards(topology: &TopologyService, config: &Config, shard_count: usize) {
    if !topology.get_snapshot().shards.is_empty() {
        return;
    }
    let primary_dc = match config.primary_dc() {
        Some(dc) => dc.id.clone(),
        None => return,
    };
    let primaries: Vec<&Server> = config.nodes_in_dc(&primary_dc);
    if primaries.is_empty() {
        return;
    }
    let replicas: Vec<NodeId> = config
        .servers
        .iter()
        .filter(|s| s.dc != primary_dc)
        .map(|s| s.id.clone())
        .collect();

    for (i, range) in HashRange::split_even(shard_count).into_iter().enumerate() {
        topology.add_shard(ShardInfo {
            id: format!("shard-{i}").into(),
            range,
            primary: primaries[i % primaries.len()].id.clone(),
            replicas: replicas.clone(),
            state: ShardState::Active,
            version: 1,
        });
    }

    // Make sure the topology host itself is registered even when absent
    // from the server table.
    for server in &config.servers {
        if topology.node(&server.id).is_none() {
            topology.add_node(NodeStatus {
                id: server.id.clone(),
                address: server.address.clone(),
                dc: server.dc.clone(),
                role: server.replica_role,
                health: NodeHealth::Unknown,
                last_seen: Utc::now(),
            });
        }
    }
}
