//! Contracts between the consensus core and the storage layer.
//!
//! The storage engine itself is an external collaborator. The core only
//! depends on [`LogStore`] for the replicated log, hard state and snapshots,
//! and on [`StateMachine`] for applying committed entries. Both return
//! `anyhow::Result`; an error from either sends the owning node into
//! shutdown, so implementations should only fail on genuinely fatal
//! conditions.

use std::ops::Range;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::raft::LogEntry;
use crate::raft::Membership;
use crate::LogId;
use crate::NodeId;

/// A record holding the hard state of a Raft node.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// The state a node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    pub last_log_id: LogId,
    pub last_applied: LogId,
    pub hard_state: HardState,
    /// The latest membership found in the log or snapshot, else an initial
    /// config of just this node.
    pub membership: Membership,
}

impl InitialState {
    /// State for a pristine node.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            last_log_id: LogId::default(),
            last_applied: LogId::default(),
            hard_state: HardState::default(),
            membership: Membership::new_initial(id),
        }
    }
}

/// Metadata of a snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Log position up to which this snapshot includes, inclusive.
    pub last_included: LogId,
    pub membership: Membership,
}

/// A complete snapshot: metadata plus the serialized state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// The replicated log, hard state and snapshot store of one node.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Fetch the last known state from stable storage, or
    /// [`InitialState::new_initial`] for a pristine node.
    async fn get_initial_state(&self, id: &NodeId) -> Result<InitialState>;

    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Append entries. Entries always arrive in index order; an entry with
    /// an index already present overwrites it.
    async fn append(&self, entries: &[LogEntry]) -> Result<()>;

    /// Entries in `[range.start, range.end)`.
    async fn entries(&self, range: Range<u64>) -> Result<Vec<LogEntry>>;

    /// The entry at `index`, if retained.
    async fn entry(&self, index: u64) -> Result<Option<LogEntry>>;

    /// The id of the last entry in the log, or of the snapshot when the log
    /// is empty, else `LogId::default()`.
    async fn last_log_id(&self) -> Result<LogId>;

    /// The earliest retained index. Entries below it are only available
    /// through the current snapshot.
    async fn first_index(&self) -> Result<u64>;

    /// Delete all entries with `index >= from`, for conflict resolution.
    async fn truncate_from(&self, from: u64) -> Result<()>;

    /// Delete all entries with `index <= through`, after snapshotting.
    async fn purge_through(&self, through: u64) -> Result<()>;

    /// Persist a freshly created or received snapshot as current.
    async fn save_snapshot(&self, snapshot: &SnapshotData) -> Result<()>;

    async fn current_snapshot(&self) -> Result<Option<SnapshotData>>;
}

/// The application state machine fed by committed entries.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed entry and return its response payload.
    ///
    /// Entries arrive in strict index order. Applying an entry whose index
    /// is not above `last_applied` must be a no-op returning the previous
    /// response semantics, so that re-application is idempotent.
    async fn apply(&self, entry: &LogEntry) -> Result<Vec<u8>>;

    async fn last_applied(&self) -> Result<LogId>;

    /// Serialize the current state for a snapshot.
    async fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the current state with a snapshot.
    async fn install(&self, last_included: LogId, data: &[u8]) -> Result<()>;

    /// A checksum over the applied state, used by cross-DC consistency
    /// verification. Must be deterministic for equal state.
    async fn checksum(&self) -> Result<u64>;
}

/// Allocator contract of the storage-engine arena.
///
/// The arena itself (block caching, NUMA binding, thread modes) is out of
/// scope; the core and the in-memory store only rely on this surface.
pub trait Arena: Send + Sync + 'static {
    /// Allocate a zeroed block of `len` bytes.
    fn alloc(&self, len: usize) -> ArenaBlock;

    /// Allocate a zeroed block padded to a multiple of `align` bytes.
    /// `align` must be a power of two.
    fn alloc_aligned(&self, len: usize, align: usize) -> ArenaBlock;

    /// Bytes currently allocated and not yet released.
    fn memory_usage(&self) -> usize;

    /// Release all accounting. Outstanding blocks stay valid; their releases
    /// after `destroy` are ignored.
    fn destroy(&self);
}

/// A block of arena memory. Releases its accounting on drop.
pub struct ArenaBlock {
    buf: Box<[u8]>,
    usage: Arc<AtomicUsize>,
}

impl ArenaBlock {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl std::ops::Deref for ArenaBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for ArenaBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for ArenaBlock {
    fn drop(&mut self) {
        // Saturating: destroy() may already have reset the counter.
        let len = self.buf.len();
        let _ = self
            .usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(len))
            });
    }
}

impl std::fmt::Debug for ArenaBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaBlock").field("len", &self.buf.len()).finish()
    }
}

/// Plain heap-backed [`Arena`] with byte accounting.
#[derive(Default)]
pub struct HeapArena {
    usage: Arc<AtomicUsize>,
}

impl HeapArena {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Arena for HeapArena {
    fn alloc(&self, len: usize) -> ArenaBlock {
        self.usage.fetch_add(len, Ordering::AcqRel);
        ArenaBlock {
            buf: vec![0u8; len].into_boxed_slice(),
            usage: self.usage.clone(),
        }
    }

    fn alloc_aligned(&self, len: usize, align: usize) -> ArenaBlock {
        debug_assert!(align.is_power_of_two());
        let padded = len.div_ceil(align.max(1)) * align.max(1);
        self.alloc(padded)
    }

    fn memory_usage(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    fn destroy(&self) {
        self.usage.store(0, Ordering::Release);
    }
}
