//! Fixtures for cluster testing: an in-process multi-node, multi-DC cluster
//! with a simulated network supporting node and DC isolation.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use concord_node::KvCommand;
use concord_node::MemKv;
use concord_node::MemLog;
use concordkv::config::Config;
use concordkv::config::DataCenter;
use concordkv::config::ReplicaRole;
use concordkv::config::Server;
use concordkv::dc::DcRuntime;
use concordkv::dc::DcView;
use concordkv::error::WriteError;
use concordkv::multidc::recovery::DcConsistency;
use concordkv::multidc::recovery::DcStateSource;
use concordkv::network::BatchAck;
use concordkv::network::BatchEnvelope;
use concordkv::network::BatchTransport;
use concordkv::network::ProbeError;
use concordkv::network::Prober;
use concordkv::network::RaftNetwork;
use concordkv::raft::AppendEntriesRequest;
use concordkv::raft::AppendEntriesResponse;
use concordkv::raft::InstallSnapshotRequest;
use concordkv::raft::InstallSnapshotResponse;
use concordkv::raft::RaftNode;
use concordkv::raft::VoteRequest;
use concordkv::raft::VoteResponse;
use concordkv::raft::WriteRequest;
use concordkv::raft::WriteResponse;
use concordkv::storage::LogStore;
use concordkv::storage::SnapshotData;
use concordkv::storage::StateMachine;
use concordkv::DcId;
use concordkv::NodeId;
use concordkv::NodeMetrics;
use concordkv::Role;

/// Initialize the tracing system for a test run.
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let fmt_layer = tracing_subscriber::fmt::layer().with_ansi(false);
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer)
        .try_init();
}

/// A concrete Raft type used during testing.
pub type SimRaft = RaftNode<NodeNet, MemLog, MemKv>;

/// One simulated node.
#[derive(Clone)]
pub struct NodeHandle {
    pub raft: SimRaft,
    pub store: Arc<MemKv>,
    pub log: Arc<MemLog>,
    pub dc_runtime: Arc<DcRuntime>,
    pub dc: DcId,
}

/// The simulated cluster: routing table plus isolation state.
pub struct ClusterSim {
    pub config: Arc<Config>,
    nodes: RwLock<BTreeMap<NodeId, NodeHandle>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl ClusterSim {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(HashSet::new()),
        })
    }

    /// Spawn a new node into the cluster.
    pub async fn add_node(self: &Arc<Self>, id: impl Into<NodeId>) -> NodeHandle {
        let id: NodeId = id.into();
        let store = Arc::new(MemKv::new());
        let log = Arc::new(MemLog::new());
        let net = Arc::new(NodeNet {
            sim: self.clone(),
            from: id.clone(),
        });
        let dc_runtime = if self.config.datacenters.is_empty() {
            DcRuntime::single_dc(id.clone())
        } else {
            let view = DcView::from_config(&self.config, &id).expect("node must be in config");
            Arc::new(DcRuntime::new(view, &self.config))
        };
        let dc = dc_runtime.view.local_dc().clone();
        let raft = RaftNode::new(
            id.clone(),
            self.config.clone(),
            dc_runtime.clone(),
            net,
            log.clone(),
            store.clone(),
        );
        let handle = NodeHandle {
            raft,
            store,
            log,
            dc_runtime,
            dc,
        };
        self.nodes.write().await.insert(id, handle.clone());
        handle
    }

    pub async fn handle(&self, id: &NodeId) -> Option<NodeHandle> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().await.keys().cloned().collect()
    }

    /// Form the cluster from `seed`'s perspective.
    pub async fn initialize_from(&self, seed: &NodeId, members: BTreeSet<NodeId>) -> Result<()> {
        let handle = self.handle(seed).await.ok_or_else(|| anyhow!("unknown node"))?;
        handle.raft.initialize(members).await?;
        Ok(())
    }

    /// Wait for any node to become leader; returns its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for (id, handle) in self.nodes.read().await.iter() {
                if handle.raft.metrics().borrow().role == Role::Leader {
                    return Ok(id.clone());
                }
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("no leader elected within {timeout:?}"));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until `id` satisfies a metrics predicate.
    pub async fn wait_for_metrics<F>(
        &self,
        id: &NodeId,
        predicate: F,
        timeout: Duration,
        msg: &str,
    ) -> Result<NodeMetrics>
    where
        F: Fn(&NodeMetrics) -> bool,
    {
        let handle = self.handle(id).await.ok_or_else(|| anyhow!("unknown node"))?;
        Ok(handle.raft.wait(Some(timeout)).metrics(predicate, msg).await?)
    }

    /// Issue a Set through the given node.
    pub async fn client_set(
        &self,
        node: &NodeId,
        key: &str,
        value: &str,
    ) -> Result<WriteResponse, WriteError> {
        let handle = self
            .handle(node)
            .await
            .ok_or(WriteError::ForwardToLeader(None))?;
        handle
            .raft
            .client_write(WriteRequest {
                data: KvCommand::Set {
                    key: key.to_string(),
                    value: value.to_string(),
                }
                .encode(),
            })
            .await
    }

    /// Read a key directly from one node's applied state.
    pub async fn get(&self, node: &NodeId, key: &str) -> Option<String> {
        let handle = self.handle(node).await?;
        handle.store.get(key).await
    }

    pub async fn isolate_node(&self, id: &NodeId) {
        self.isolated.write().await.insert(id.clone());
    }

    pub async fn restore_node(&self, id: &NodeId) {
        self.isolated.write().await.remove(id);
    }

    /// Cut every node of a DC off the network.
    pub async fn isolate_dc(&self, dc: &DcId) {
        let nodes = self.nodes.read().await;
        let mut isolated = self.isolated.write().await;
        for (id, handle) in nodes.iter() {
            if &handle.dc == dc {
                isolated.insert(id.clone());
            }
        }
    }

    async fn check_link(&self, from: &NodeId, to: &NodeId) -> Result<()> {
        let isolated = self.isolated.read().await;
        if isolated.contains(from) {
            return Err(anyhow!("node {from} is isolated"));
        }
        if isolated.contains(to) {
            return Err(anyhow!("node {to} is isolated"));
        }
        Ok(())
    }

    async fn raft_of(&self, id: &NodeId) -> Result<SimRaft> {
        self.handle(id)
            .await
            .map(|h| h.raft)
            .ok_or_else(|| anyhow!("unknown node {id}"))
    }

    /// A transport rooted at `from`, for wiring replicators and detectors
    /// the way a node binary would.
    pub fn network_from(self: &Arc<Self>, from: &NodeId) -> Arc<NodeNet> {
        Arc::new(NodeNet {
            sim: self.clone(),
            from: from.clone(),
        })
    }

    pub async fn shutdown(&self) {
        let nodes: Vec<NodeHandle> = self.nodes.read().await.values().cloned().collect();
        for handle in nodes {
            let _ = handle.raft.shutdown().await;
        }
    }
}

/// The network as seen from one node: every send checks both endpoints'
/// isolation.
pub struct NodeNet {
    sim: Arc<ClusterSim>,
    from: NodeId,
}

#[async_trait]
impl RaftNetwork for NodeNet {
    async fn send_vote(&self, target: &NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.sim.check_link(&self.from, target).await?;
        let raft = self.sim.raft_of(target).await?;
        Ok(raft.vote(rpc).await?)
    }

    async fn send_append_entries(
        &self,
        target: &NodeId,
        rpc: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.sim.check_link(&self.from, target).await?;
        let raft = self.sim.raft_of(target).await?;
        Ok(raft.append_entries(rpc).await?)
    }

    async fn send_install_snapshot(
        &self,
        target: &NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.sim.check_link(&self.from, target).await?;
        let raft = self.sim.raft_of(target).await?;
        Ok(raft.install_snapshot(rpc).await?)
    }
}

#[async_trait]
impl BatchTransport for NodeNet {
    /// Apply a replication batch to the target's state machine, the way the
    /// node's replication intake endpoint does.
    async fn send_batch(&self, target: &NodeId, batch: BatchEnvelope) -> Result<BatchAck> {
        self.sim.check_link(&self.from, target).await?;
        let handle = self
            .sim
            .handle(target)
            .await
            .ok_or_else(|| anyhow!("unknown node {target}"))?;
        let entries =
            concordkv::multidc::replicator::decode_payload(&batch.payload, batch.compressed)?;
        for entry in &entries {
            let applied = handle.store.last_applied().await?;
            if entry.index <= applied.index {
                continue;
            }
            if entry.index != applied.index + 1 {
                break;
            }
            handle.store.apply(entry).await?;
        }
        handle.log.append(&entries).await?;
        let applied = handle.store.last_applied().await?;
        Ok(BatchAck {
            batch_id: batch.batch_id,
            last_applied_index: applied.index,
        })
    }

    async fn send_snapshot(&self, target: &NodeId, snapshot: SnapshotData) -> Result<()> {
        self.sim.check_link(&self.from, target).await?;
        let handle = self
            .sim
            .handle(target)
            .await
            .ok_or_else(|| anyhow!("unknown node {target}"))?;
        handle
            .store
            .install(snapshot.meta.last_included, &snapshot.data)
            .await?;
        handle.log.save_snapshot(&snapshot).await?;
        Ok(())
    }
}

#[async_trait]
impl Prober for NodeNet {
    async fn probe(&self, target: &NodeId) -> Result<Duration, ProbeError> {
        if self.sim.check_link(&self.from, target).await.is_err() {
            return Err(ProbeError::Unreachable);
        }
        if self.sim.handle(target).await.is_none() {
            return Err(ProbeError::Refused);
        }
        Ok(Duration::from_millis(1))
    }
}

/// Read per-DC applied state straight out of the simulated stores, taking
/// the most advanced node per DC.
pub struct SimStates {
    pub sim: Arc<ClusterSim>,
}

#[async_trait]
impl DcStateSource for SimStates {
    async fn dc_state(&self, dc: &DcId) -> Result<DcConsistency> {
        let nodes = self.sim.nodes.read().await;
        let mut best: Option<DcConsistency> = None;
        for handle in nodes.values() {
            if &handle.dc != dc {
                continue;
            }
            let applied = handle.store.last_applied().await?;
            let state = DcConsistency {
                last_index: applied.index,
                last_term: applied.term,
                checksum: handle.store.checksum().await?,
            };
            if best.as_ref().map(|b| state.last_index > b.last_index).unwrap_or(true) {
                best = Some(state);
            }
        }
        best.ok_or_else(|| anyhow!("no nodes in dc {dc}"))
    }
}

/// A fast config for single-DC cluster tests.
pub fn single_dc_config() -> Arc<Config> {
    Arc::new(
        Config::build("sim")
            .election_timeout_min(100)
            .election_timeout_max(200)
            .heartbeat_interval(30)
            .validate()
            .expect("failed to build test config"),
    )
}

fn server(id: &str, dc: &str, role: ReplicaRole) -> Server {
    Server {
        id: id.into(),
        address: format!("10.0.{}.{}:7000", dc.len(), id.len()),
        dc: dc.into(),
        replica_role: role,
    }
}

/// Two DCs: dc1 primary with n1..n3, dc2 with n4, n5 as async replicas.
pub fn two_dc_config() -> Arc<Config> {
    let mut replicator = concordkv::config::ReplicatorConfig::default();
    replicator.flush_interval = 10;
    replicator.retry_backoff = 5;
    replicator.retry_backoff_max = 50;
    let mut detector = concordkv::config::DetectorConfig::default();
    detector.heartbeat_interval = 50;
    detector.suspect_factor = 1.0;
    detector.min_confirmations = 3;
    detector.recovery_streak = 2;
    detector.probe_interval = 25;
    let failover = concordkv::config::FailoverConfig {
        auto_failover_enabled: true,
        manual_confirmation_required: false,
        min_score_for_failover: 0.0,
        catch_up_timeout: 3_000,
    };
    Arc::new(
        Config::build("sim-multidc")
            .election_timeout_min(100)
            .election_timeout_max(200)
            .heartbeat_interval(30)
            .primary_dc_timeout_factor(3)
            .datacenter(DataCenter::new("dc1", "east").primary())
            .datacenter(DataCenter::new("dc2", "west"))
            .server(server("n1", "dc1", ReplicaRole::Primary))
            .server(server("n2", "dc1", ReplicaRole::Primary))
            .server(server("n3", "dc1", ReplicaRole::Primary))
            .server(server("n4", "dc2", ReplicaRole::AsyncReplica))
            .server(server("n5", "dc2", ReplicaRole::AsyncReplica))
            .replicator(replicator)
            .detector(detector)
            .failover(failover)
            .validate()
            .expect("failed to build multi-dc test config"),
    )
}
