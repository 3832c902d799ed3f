//! The authoritative topology service.
//!
//! Single writer, many readers: mutators take the exclusive lock, bump the
//! global version and publish an event stamped with it; readers take cheap
//! snapshots. Subscribers get bounded buffers; a subscriber that cannot keep
//! up is disconnected rather than allowed to stall publication.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::Config;
use crate::error::TopologyError;
use crate::network::Prober;
use crate::topology::NodeHealth;
use crate::topology::NodeStatus;
use crate::topology::ShardInfo;
use crate::topology::TopologyEvent;
use crate::topology::TopologyEventKind;
use crate::topology::TopologyEventType;
use crate::topology::TopologySnapshot;
use crate::DcId;
use crate::NodeId;
use crate::ShardId;

const SUBSCRIBER_BUFFER: usize = 64;

struct TopologyState {
    version: i64,
    nodes: HashMap<NodeId, NodeStatus>,
    shards: HashMap<ShardId, ShardInfo>,
    dcs: HashMap<DcId, crate::config::DataCenter>,
}

struct Subscriber {
    client_id: String,
    types: Option<HashSet<TopologyEventType>>,
    tx: mpsc::Sender<TopologyEvent>,
}

/// An event subscription handed to one client.
pub struct Subscription {
    pub client_id: String,
    pub events: mpsc::Receiver<TopologyEvent>,
}

/// The authoritative source of the shard and node map.
pub struct TopologyService {
    state: RwLock<TopologyState>,
    subs: Mutex<Vec<Subscriber>>,
}

impl Default for TopologyService {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyService {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TopologyState {
                version: 0,
                nodes: HashMap::new(),
                shards: HashMap::new(),
                dcs: HashMap::new(),
            }),
            subs: Mutex::new(Vec::new()),
        }
    }

    /// Seed the node directory and DC table from config.
    pub fn from_config(config: &Config) -> Self {
        let service = Self::new();
        {
            let mut state = service.state.write().unwrap();
            for dc in &config.datacenters {
                state.dcs.insert(dc.id.clone(), dc.clone());
            }
            for server in &config.servers {
                state.nodes.insert(
                    server.id.clone(),
                    NodeStatus {
                        id: server.id.clone(),
                        address: server.address.clone(),
                        dc: server.dc.clone(),
                        role: server.replica_role,
                        health: NodeHealth::Unknown,
                        last_seen: Utc::now(),
                    },
                );
            }
            state.version = 1;
        }
        service
    }

    pub fn version(&self) -> i64 {
        self.state.read().unwrap().version
    }

    /// A complete read-only snapshot at the current version.
    pub fn get_snapshot(&self) -> TopologySnapshot {
        let state = self.state.read().unwrap();
        TopologySnapshot {
            version: state.version,
            nodes: state.nodes.clone(),
            shards: state.shards.clone(),
            dcs: state.dcs.clone(),
        }
    }

    /// Subscribe to events, optionally filtered by type. Slow consumers are
    /// disconnected once their buffer fills.
    pub fn subscribe(
        &self,
        client_id: impl Into<String>,
        types: Option<Vec<TopologyEventType>>,
    ) -> Subscription {
        let client_id = client_id.into();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subs.lock().unwrap().push(Subscriber {
            client_id: client_id.clone(),
            types: types.map(|t| t.into_iter().collect()),
            tx,
        });
        Subscription {
            client_id,
            events: rx,
        }
    }

    /// Fan an event out to matching subscribers at the current version.
    pub fn publish_event(&self, kind: TopologyEventKind) {
        let version = self.version();
        self.fan_out(TopologyEvent { version, kind });
    }

    fn fan_out(&self, event: TopologyEvent) {
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|sub| {
            if let Some(types) = &sub.types {
                if !types.contains(&event.kind.event_type()) {
                    return true;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(client = %sub.client_id, "disconnecting slow topology subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Mutate under the exclusive lock, bump the version, then publish.
    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut TopologyState) -> Option<TopologyEventKind>,
    {
        let event = {
            let mut state = self.state.write().unwrap();
            match f(&mut state) {
                Some(kind) => {
                    state.version += 1;
                    Some(TopologyEvent {
                        version: state.version,
                        kind,
                    })
                }
                None => None,
            }
        };
        if let Some(event) = event {
            self.fan_out(event);
        }
    }

    pub fn add_node(&self, status: NodeStatus) {
        self.mutate(|state| {
            state.nodes.insert(status.id.clone(), status.clone());
            Some(TopologyEventKind::NodeAdded(status))
        });
    }

    pub fn remove_node(&self, id: &NodeId) {
        self.mutate(|state| {
            state
                .nodes
                .remove(id)
                .map(|_| TopologyEventKind::NodeRemoved(id.clone()))
        });
    }

    pub fn node(&self, id: &NodeId) -> Option<NodeStatus> {
        self.state.read().unwrap().nodes.get(id).cloned()
    }

    /// Record a node health observation; publishes only on change.
    pub fn set_node_health(&self, id: &NodeId, health: NodeHealth) {
        self.mutate(|state| {
            let node = state.nodes.get_mut(id)?;
            node.last_seen = Utc::now();
            if node.health == health {
                return None;
            }
            node.health = health;
            Some(TopologyEventKind::NodeHealthChanged {
                node: id.clone(),
                health,
            })
        });
    }

    pub fn add_shard(&self, info: ShardInfo) {
        self.mutate(|state| {
            state.shards.insert(info.id.clone(), info.clone());
            Some(TopologyEventKind::ShardAdded(info))
        });
    }

    pub fn remove_shard(&self, id: &ShardId) {
        self.mutate(|state| {
            state
                .shards
                .remove(id)
                .map(|_| TopologyEventKind::ShardRemoved(id.clone()))
        });
    }

    pub fn shard(&self, id: &ShardId) -> Option<ShardInfo> {
        self.state.read().unwrap().shards.get(id).cloned()
    }

    /// Update a shard, enforcing the strictly-increasing version invariant,
    /// and publish `ShardUpdated`.
    pub fn update_shard(&self, info: ShardInfo) -> Result<(), TopologyError> {
        self.update_shard_inner(info, true)
    }

    /// Update a shard without publishing or bumping the global version.
    ///
    /// Used by the failover coordinator to stage promotions that are
    /// published as one atomic step later (or reverted on rollback).
    pub fn update_shard_silent(&self, info: ShardInfo) -> Result<(), TopologyError> {
        self.update_shard_inner(info, false)
    }

    fn update_shard_inner(&self, info: ShardInfo, publish: bool) -> Result<(), TopologyError> {
        let event = {
            let mut state = self.state.write().unwrap();
            let current = state
                .shards
                .get(&info.id)
                .ok_or_else(|| TopologyError::UnknownShard(info.id.clone()))?;
            if info.version <= current.version {
                return Err(TopologyError::VersionRegression {
                    shard: info.id.clone(),
                    current: current.version,
                    proposed: info.version,
                });
            }
            state.shards.insert(info.id.clone(), info.clone());
            if publish {
                state.version += 1;
                Some(TopologyEvent {
                    version: state.version,
                    kind: TopologyEventKind::ShardUpdated(info),
                })
            } else {
                None
            }
        };
        if let Some(event) = event {
            self.fan_out(event);
        }
        Ok(())
    }

    /// Revert a silently staged shard update during failover rollback. The
    /// version invariant is suspended: the authoritative entry goes back to
    /// exactly the pre-staging record.
    pub(crate) fn revert_shard(&self, info: ShardInfo) {
        let mut state = self.state.write().unwrap();
        state.shards.insert(info.id.clone(), info);
    }

    /// Publish `ShardUpdated` for previously staged shards under one global
    /// version bump.
    pub fn publish_shard_updates(&self, ids: &[ShardId]) {
        let events: Vec<TopologyEvent> = {
            let mut state = self.state.write().unwrap();
            state.version += 1;
            let version = state.version;
            ids.iter()
                .filter_map(|id| state.shards.get(id).cloned())
                .map(|info| TopologyEvent {
                    version,
                    kind: TopologyEventKind::ShardUpdated(info),
                })
                .collect()
        };
        for event in events {
            self.fan_out(event);
        }
    }

    /// The shard owning `key`, by hash range.
    pub fn shard_for_key(&self, key: &str) -> Option<ShardInfo> {
        let state = self.state.read().unwrap();
        state.shards.values().find(|s| s.owns_key(key)).cloned()
    }

    /// Shards whose primary currently lives in `dc`.
    pub fn shards_with_primary_in(&self, dc: &DcId) -> Vec<ShardInfo> {
        let state = self.state.read().unwrap();
        state
            .shards
            .values()
            .filter(|shard| {
                state
                    .nodes
                    .get(&shard.primary)
                    .map(|n| &n.dc == dc)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Healthy nodes of `dc`, preferred replica targets for promotion.
    pub fn healthy_nodes_in(&self, dc: &DcId) -> Vec<NodeId> {
        let state = self.state.read().unwrap();
        let mut nodes: Vec<NodeId> = state
            .nodes
            .values()
            .filter(|n| &n.dc == dc && n.health != NodeHealth::Unhealthy)
            .map(|n| n.id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// One health-check pass over every registered node.
    pub async fn health_check_pass<P: Prober>(&self, prober: &P) {
        let nodes: Vec<NodeId> = {
            let state = self.state.read().unwrap();
            state.nodes.keys().cloned().collect()
        };
        for node in nodes {
            let health = match prober.probe(&node).await {
                Ok(_) => NodeHealth::Healthy,
                Err(err) => {
                    tracing::debug!(node = %node, error = %err, "node health probe failed");
                    NodeHealth::Unhealthy
                }
            };
            self.set_node_health(&node, health);
        }
    }

    /// Spawn the periodic health-check worker.
    pub fn start_health_loop<P: Prober>(
        self: &Arc<Self>,
        prober: Arc<P>,
        period: Duration,
    ) -> JoinHandle<()> {
        let this = self.clone();
        crate::supervise("topology-health", move || {
            let this = this.clone();
            let prober = prober.clone();
            async move {
                let mut ticker = interval(period);
                loop {
                    ticker.tick().await;
                    this.health_check_pass(prober.as_ref()).await;
                }
            }
        })
    }
}
