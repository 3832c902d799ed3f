//! Cluster topology: shard map, node directory and the event surface.

mod service;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;

use crate::config::DataCenter;
use crate::config::ReplicaRole;
use crate::fnv1a_64;
use crate::DcId;
use crate::NodeId;
use crate::ShardId;

pub use service::Subscription;
pub use service::TopologyService;

/// Lifecycle state of a shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    Active,
    Migrating,
    Splitting,
    Merging,
    Offline,
}

/// A half-open hash range `[start_hash, end_hash)`. The topmost range of a
/// partition carries `end_hash == u64::MAX` and also owns the maximum hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRange {
    pub start_hash: u64,
    pub end_hash: u64,
}

impl HashRange {
    pub fn contains(&self, hash: u64) -> bool {
        hash >= self.start_hash && (hash < self.end_hash || self.end_hash == u64::MAX)
    }

    /// Partition the full hash space into `n` even ranges.
    pub fn split_even(n: usize) -> Vec<HashRange> {
        let n = n.max(1) as u64;
        let width = u64::MAX / n;
        (0..n)
            .map(|i| HashRange {
                start_hash: i * width,
                end_hash: if i == n - 1 { u64::MAX } else { (i + 1) * width },
            })
            .collect()
    }
}

/// Authoritative description of one shard.
///
/// Exactly one primary; `version` is strictly increasing per shard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: ShardId,
    pub range: HashRange,
    pub primary: NodeId,
    pub replicas: Vec<NodeId>,
    pub state: ShardState,
    pub version: i64,
}

impl ShardInfo {
    pub fn owns_key(&self, key: &str) -> bool {
        self.range.contains(fnv1a_64(key.as_bytes()))
    }

    /// The primary followed by the replicas, without duplicates.
    pub fn all_nodes(&self) -> Vec<NodeId> {
        let mut nodes = vec![self.primary.clone()];
        for replica in &self.replicas {
            if !nodes.contains(replica) {
                nodes.push(replica.clone());
            }
        }
        nodes
    }
}

/// Node health as recorded by the topology service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Directory record of one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub address: String,
    pub dc: DcId,
    pub role: ReplicaRole,
    pub health: NodeHealth,
    pub last_seen: DateTime<Utc>,
}

/// A complete, versioned view of the topology.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub version: i64,
    pub nodes: HashMap<NodeId, NodeStatus>,
    pub shards: HashMap<ShardId, ShardInfo>,
    pub dcs: HashMap<DcId, DataCenter>,
}

/// Filterable category of a topology event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopologyEventType {
    NodeAdded,
    NodeRemoved,
    NodeHealthChanged,
    ShardAdded,
    ShardRemoved,
    ShardUpdated,
    ConfigChanged,
}

/// Payload of a topology change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TopologyEventKind {
    NodeAdded(NodeStatus),
    NodeRemoved(NodeId),
    NodeHealthChanged { node: NodeId, health: NodeHealth },
    ShardAdded(ShardInfo),
    ShardRemoved(ShardId),
    ShardUpdated(ShardInfo),
    ConfigChanged,
}

impl TopologyEventKind {
    pub fn event_type(&self) -> TopologyEventType {
        match self {
            Self::NodeAdded(_) => TopologyEventType::NodeAdded,
            Self::NodeRemoved(_) => TopologyEventType::NodeRemoved,
            Self::NodeHealthChanged { .. } => TopologyEventType::NodeHealthChanged,
            Self::ShardAdded(_) => TopologyEventType::ShardAdded,
            Self::ShardRemoved(_) => TopologyEventType::ShardRemoved,
            Self::ShardUpdated(_) => TopologyEventType::ShardUpdated,
            Self::ConfigChanged => TopologyEventType::ConfigChanged,
        }
    }
}

/// An event plus the topology version at publish time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyEvent {
    pub version: i64,
    pub kind: TopologyEventKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_cover_the_space() {
        let ranges = HashRange::split_even(4);
        assert_eq!(ranges.len(), 4);
        for probe in [0u64, 1, u64::MAX / 3, u64::MAX / 2, u64::MAX - 1, u64::MAX] {
            let owners = ranges.iter().filter(|r| r.contains(probe)).count();
            assert_eq!(owners, 1, "hash {probe} should have exactly one owner");
        }
    }

    #[test]
    fn shard_key_ownership_is_deterministic() {
        let ranges = HashRange::split_even(2);
        let shards: Vec<ShardInfo> = ranges
            .into_iter()
            .enumerate()
            .map(|(i, range)| ShardInfo {
                id: format!("s{i}").into(),
                range,
                primary: "n1".into(),
                replicas: vec!["n2".into()],
                state: ShardState::Active,
                version: 1,
            })
            .collect();
        let owner_a = shards.iter().find(|s| s.owns_key("k1")).unwrap();
        let owner_b = shards.iter().find(|s| s.owns_key("k1")).unwrap();
        assert_eq!(owner_a.id, owner_b.id);
    }
}
