//! ConcordKV core: Raft consensus with multi-datacenter replication.
//!
//! The crate is organised in layers. [`raft`] and [`core`] implement per-node
//! consensus; [`dc`] extends election and heartbeat behaviour with
//! datacenter awareness; [`multidc`] holds the cross-DC pipeline (async
//! replicator, failure detector, consistency recovery, failover
//! coordinator); [`topology`] is the authoritative cluster view; [`client`]
//! is the topology-aware smart client (cache, router, connection pool).
//!
//! Storage engines are external collaborators: the crate only depends on the
//! [`storage::LogStore`] and [`storage::StateMachine`] contracts.

pub mod client;
pub mod config;
mod core;
pub mod dc;
pub mod error;
pub mod metrics;
pub mod multidc;
pub mod network;
pub mod raft;
mod replication;
pub mod storage;
pub mod topology;

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

pub use async_trait;

pub use crate::config::Config;
pub use crate::core::Role;
pub use crate::metrics::NodeMetrics;
pub use crate::metrics::Wait;
pub use crate::network::BatchTransport;
pub use crate::network::Prober;
pub use crate::network::RaftNetwork;
pub use crate::raft::RaftNode;
pub use crate::storage::LogStore;
pub use crate::storage::StateMachine;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

opaque_id! {
    /// Identifier of a single node in the cluster.
    NodeId
}

opaque_id! {
    /// Identifier of a datacenter.
    DcId
}

opaque_id! {
    /// Identifier of a hash-range shard of the key space.
    ShardId
}

/// The term and index of a position in the Raft log.
///
/// Ordering is term-major, which is exactly the "more up-to-date" comparison
/// of the Raft election restriction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A compact, single-line rendering of a message for tracing output.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

/// 64-bit FNV-1a.
///
/// Used for key-to-shard mapping, hash-ring token placement and state
/// checksums. Deterministic across processes, which the hash ring and the
/// consistency checksums both rely on.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Spawn a background worker that is restarted if it panics.
///
/// Invariant violations panic the owning subsystem only; the supervisor
/// restarts the worker a bounded number of times before giving up.
pub(crate) fn supervise<F, Fut>(name: &'static str, mut factory: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    const MAX_RESTARTS: u32 = 5;
    tokio::spawn(async move {
        let mut restarts = 0;
        loop {
            let handle = tokio::spawn(factory());
            match handle.await {
                Ok(()) => return,
                Err(err) if err.is_panic() => {
                    restarts += 1;
                    if restarts > MAX_RESTARTS {
                        tracing::error!(worker = name, "worker panicked too many times, giving up");
                        return;
                    }
                    tracing::error!(worker = name, restarts, "worker panicked, restarting");
                }
                Err(_) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_is_stable() {
        // Reference vector for the empty input per the FNV spec.
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"k1"), fnv1a_64(b"k1"));
        assert_ne!(fnv1a_64(b"k1"), fnv1a_64(b"k2"));
    }

    #[test]
    fn log_id_orders_term_major() {
        assert!(LogId::new(2, 1) > LogId::new(1, 9));
        assert!(LogId::new(2, 3) > LogId::new(2, 2));
    }
}
