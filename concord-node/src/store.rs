//! In-memory implementations of the storage contracts.
//!
//! `MemKv` is the KV state machine: commands are JSON-encoded in log entry
//! payloads, re-application below the applied index is a no-op, and value
//! storage is accounted through the arena contract. `MemLog` is the
//! in-memory log, hard-state and snapshot store.

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use concordkv::fnv1a_64;
use concordkv::raft::EntryKind;
use concordkv::raft::LogEntry;
use concordkv::raft::Membership;
use concordkv::storage::Arena;
use concordkv::storage::ArenaBlock;
use concordkv::storage::HardState;
use concordkv::storage::HeapArena;
use concordkv::storage::InitialState;
use concordkv::storage::LogStore;
use concordkv::storage::SnapshotData;
use concordkv::storage::StateMachine;
use concordkv::LogId;
use concordkv::NodeId;

/// A KV mutation carried in a `Normal` log entry's payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("malformed kv command payload")
    }
}

/// The state-machine response to one applied command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvResponse {
    /// The value the key held before this command, if any.
    pub previous: Option<String>,
}

struct KvState {
    data: BTreeMap<String, ArenaBlock>,
    last_applied: LogId,
}

/// The in-memory KV state machine.
pub struct MemKv {
    arena: HeapArena,
    state: RwLock<KvState>,
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemKv {
    pub fn new() -> Self {
        Self {
            arena: HeapArena::new(),
            state: RwLock::new(KvState {
                data: BTreeMap::new(),
                last_applied: LogId::default(),
            }),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .data
            .get(key)
            .map(|block| String::from_utf8_lossy(block).into_owned())
    }

    pub async fn keys(&self) -> Vec<String> {
        self.state.read().await.data.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.data.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Bytes of value storage currently allocated.
    pub fn memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    fn store_value(&self, value: &str) -> ArenaBlock {
        let mut block = self.arena.alloc(value.len());
        block.copy_from_slice(value.as_bytes());
        block
    }
}

#[async_trait]
impl StateMachine for MemKv {
    async fn apply(&self, entry: &LogEntry) -> Result<Vec<u8>> {
        let mut state = self.state.write().await;

        // Idempotent re-application: anything at or below the applied index
        // has already taken effect.
        if entry.index <= state.last_applied.index {
            return Ok(serde_json::to_vec(&KvResponse::default())?);
        }
        if entry.index != state.last_applied.index + 1 {
            bail!(
                "out-of-order apply: entry {} after applied {}",
                entry.index,
                state.last_applied.index
            );
        }

        let response = match entry.kind {
            EntryKind::Normal => {
                let command = KvCommand::decode(&entry.data)?;
                let previous = match command {
                    KvCommand::Set { key, value } => {
                        let block = self.store_value(&value);
                        state.data.insert(key, block)
                    }
                    KvCommand::Delete { key } => state.data.remove(&key),
                };
                KvResponse {
                    previous: previous.map(|block| String::from_utf8_lossy(&block).into_owned()),
                }
            }
            EntryKind::Config | EntryKind::NoOp => KvResponse::default(),
        };

        state.last_applied = entry.log_id();
        Ok(serde_json::to_vec(&response)?)
    }

    async fn last_applied(&self) -> Result<LogId> {
        Ok(self.state.read().await.last_applied)
    }

    async fn snapshot(&self) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        let plain: BTreeMap<&String, String> = state
            .data
            .iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(v).into_owned()))
            .collect();
        Ok(serde_json::to_vec(&plain)?)
    }

    async fn install(&self, last_included: LogId, data: &[u8]) -> Result<()> {
        let plain: BTreeMap<String, String> =
            serde_json::from_slice(data).context("malformed snapshot payload")?;
        let mut state = self.state.write().await;
        state.data = plain
            .into_iter()
            .map(|(k, v)| {
                let block = self.store_value(&v);
                (k, block)
            })
            .collect();
        state.last_applied = last_included;
        Ok(())
    }

    async fn checksum(&self) -> Result<u64> {
        let state = self.state.read().await;
        let mut hash = 0u64;
        for (key, value) in &state.data {
            let mut pair = Vec::with_capacity(key.len() + value.len() + 2);
            pair.extend_from_slice(key.as_bytes());
            pair.push(0);
            pair.extend_from_slice(value);
            pair.push(0);
            hash = hash.wrapping_mul(31).wrapping_add(fnv1a_64(&pair));
        }
        Ok(hash)
    }
}

struct LogInner {
    log: BTreeMap<u64, LogEntry>,
    hard_state: HardState,
    has_state: bool,
    snapshot: Option<SnapshotData>,
}

/// The in-memory log store.
pub struct MemLog {
    inner: RwLock<LogInner>,
}

impl Default for MemLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemLog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LogInner {
                log: BTreeMap::new(),
                hard_state: HardState::default(),
                has_state: false,
                snapshot: None,
            }),
        }
    }
}

#[async_trait]
impl LogStore for MemLog {
    async fn get_initial_state(&self, id: &NodeId) -> Result<InitialState> {
        let inner = self.inner.read().await;
        if !inner.has_state && inner.log.is_empty() && inner.snapshot.is_none() {
            return Ok(InitialState::new_initial(id.clone()));
        }

        let snapshot_meta = inner.snapshot.as_ref().map(|s| s.meta.clone());
        let last_log_id = inner
            .log
            .values()
            .next_back()
            .map(|e| e.log_id())
            .or_else(|| snapshot_meta.as_ref().map(|m| m.last_included))
            .unwrap_or_default();

        // Latest membership: newest config entry in the log, else the one
        // embedded in the snapshot.
        let membership = inner
            .log
            .values()
            .rev()
            .find(|e| e.kind == EntryKind::Config)
            .and_then(LogEntry::membership)
            .or_else(|| snapshot_meta.as_ref().map(|m| m.membership.clone()))
            .unwrap_or_else(|| Membership::new_initial(id.clone()));

        Ok(InitialState {
            last_log_id,
            last_applied: snapshot_meta.map(|m| m.last_included).unwrap_or_default(),
            hard_state: inner.hard_state.clone(),
            membership,
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.hard_state = hs.clone();
        inner.has_state = true;
        Ok(())
    }

    async fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for entry in entries {
            inner.log.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    async fn entries(&self, range: Range<u64>) -> Result<Vec<LogEntry>> {
        let inner = self.inner.read().await;
        Ok(inner.log.range(range).map(|(_, e)| e.clone()).collect())
    }

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        Ok(self.inner.read().await.log.get(&index).cloned())
    }

    async fn last_log_id(&self) -> Result<LogId> {
        let inner = self.inner.read().await;
        Ok(inner
            .log
            .values()
            .next_back()
            .map(|e| e.log_id())
            .or_else(|| inner.snapshot.as_ref().map(|s| s.meta.last_included))
            .unwrap_or_default())
    }

    async fn first_index(&self) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .log
            .keys()
            .next()
            .copied()
            .or_else(|| inner.snapshot.as_ref().map(|s| s.meta.last_included.index + 1))
            .unwrap_or(1))
    }

    async fn truncate_from(&self, from: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.log.retain(|index, _| *index < from);
        Ok(())
    }

    async fn purge_through(&self, through: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.log.retain(|index, _| *index > through);
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &SnapshotData) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.snapshot = Some(snapshot.clone());
        inner.has_state = true;
        Ok(())
    }

    async fn current_snapshot(&self) -> Result<Option<SnapshotData>> {
        Ok(self.inner.read().await.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn set(index: u64, key: &str, value: &str) -> LogEntry {
        LogEntry::normal(
            index,
            1,
            KvCommand::Set {
                key: key.to_string(),
                value: value.to_string(),
            }
            .encode(),
        )
    }

    #[tokio::test]
    async fn apply_set_get_delete() {
        let kv = MemKv::new();
        kv.apply(&set(1, "k1", "v1")).await.unwrap();
        assert_eq!(kv.get("k1").await, Some("v1".to_string()));
        assert!(kv.memory_usage() > 0);

        let raw = kv.apply(&set(2, "k1", "v2")).await.unwrap();
        let response: KvResponse = serde_json::from_slice(&raw).unwrap();
        assert_eq!(response.previous, Some("v1".to_string()));

        kv.apply(&LogEntry::normal(
            3,
            1,
            KvCommand::Delete {
                key: "k1".to_string(),
            }
            .encode(),
        ))
        .await
        .unwrap();
        assert_eq!(kv.get("k1").await, None);
        assert_eq!(kv.memory_usage(), 0);
    }

    #[tokio::test]
    async fn reapplication_is_idempotent() {
        let kv = MemKv::new();
        kv.apply(&set(1, "k1", "v1")).await.unwrap();
        kv.apply(&set(2, "k2", "v2")).await.unwrap();
        let checksum_before = kv.checksum().await.unwrap();

        // Replay the same batch: state and checksum unchanged.
        kv.apply(&set(1, "k1", "v1")).await.unwrap();
        kv.apply(&set(2, "k2", "v2")).await.unwrap();
        assert_eq!(kv.checksum().await.unwrap(), checksum_before);
        assert_eq!(kv.last_applied().await.unwrap().index, 2);
    }

    #[tokio::test]
    async fn out_of_order_apply_is_refused() {
        let kv = MemKv::new();
        kv.apply(&set(1, "k1", "v1")).await.unwrap();
        assert!(kv.apply(&set(3, "k3", "v3")).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_round_trips_state() {
        let kv = MemKv::new();
        kv.apply(&set(1, "k1", "v1")).await.unwrap();
        kv.apply(&set(2, "k2", "v2")).await.unwrap();
        let data = kv.snapshot().await.unwrap();
        let checksum = kv.checksum().await.unwrap();

        let restored = MemKv::new();
        restored.install(LogId::new(1, 2), &data).await.unwrap();
        assert_eq!(restored.get("k1").await, Some("v1".to_string()));
        assert_eq!(restored.get("k2").await, Some("v2".to_string()));
        assert_eq!(restored.checksum().await.unwrap(), checksum);
        assert_eq!(restored.last_applied().await.unwrap(), LogId::new(1, 2));
    }

    #[tokio::test]
    async fn log_store_ranges_and_purge() {
        let log = MemLog::new();
        let entries: Vec<LogEntry> = (1..=5).map(|i| set(i, "k", "v")).collect();
        log.append(&entries).await.unwrap();

        assert_eq!(log.first_index().await.unwrap(), 1);
        assert_eq!(log.last_log_id().await.unwrap().index, 5);
        assert_eq!(log.entries(2..4).await.unwrap().len(), 2);

        log.purge_through(3).await.unwrap();
        assert_eq!(log.first_index().await.unwrap(), 4);
        log.truncate_from(5).await.unwrap();
        assert_eq!(log.last_log_id().await.unwrap().index, 4);
    }

    #[tokio::test]
    async fn initial_state_recovers_membership_from_log() {
        let log = MemLog::new();
        let membership = Membership::new_initial("n1".into()).with_voter("n2".into());
        log.append(&[LogEntry::config(1, 1, &membership)]).await.unwrap();
        log.save_hard_state(&HardState {
            current_term: 1,
            voted_for: Some("n1".into()),
        })
        .await
        .unwrap();

        let state = log.get_initial_state(&"n1".into()).await.unwrap();
        assert_eq!(state.membership, membership);
        assert_eq!(state.hard_state.current_term, 1);
        assert_eq!(state.last_log_id.index, 1);
    }

    #[tokio::test]
    async fn pristine_log_yields_initial_state() {
        let log = MemLog::new();
        let state = log.get_initial_state(&"n1".into()).await.unwrap();
        assert_eq!(state.last_log_id, LogId::default());
        assert!(state.membership.is_voter(&"n1".into()));
    }
}
