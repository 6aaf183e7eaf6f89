//! Offline store-and-forward queue for task mutations.
//!
//! While the channel is offline, mutations are recorded as
//! [`PendingAction`]s in submission order. When connectivity returns,
//! [`crate::resilient::ResilientClient`] drains the queue FIFO and
//! replays each action against the hub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tasksync_proto::task::{Task, TaskId};

/// A deferred task mutation.
///
/// `Update` and `SetCompletion` both replay as an update call; they are
/// kept distinct so queue inspection shows the user's intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    /// Create a task.
    Add(Task),
    /// Replace a task's fields.
    Update(Task),
    /// Toggle a task's completion (carried as the full modified task).
    SetCompletion(Task),
    /// Delete a task.
    Delete(TaskId),
    /// Acquire a task's edit lock.
    Lock(TaskId),
    /// Release a task's edit lock.
    Unlock(TaskId),
}

impl PendingOp {
    /// Short operation name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Update(_) => "update",
            Self::SetCompletion(_) => "set_completion",
            Self::Delete(_) => "delete",
            Self::Lock(_) => "lock",
            Self::Unlock(_) => "unlock",
        }
    }
}

/// One queued mutation, stamped with a monotonic sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    /// Monotonic sequence number; replay order follows it.
    pub seq: u64,
    /// The user the mutation belongs to.
    pub user_id: u64,
    /// Unix timestamp (milliseconds) when the action was queued.
    pub queued_at_ms: u64,
    /// The deferred mutation.
    pub op: PendingOp,
}

/// Store-and-forward queue contract.
///
/// Implementations must preserve FIFO order in [`snapshot`](Self::snapshot).
pub trait OfflineQueue: Send + Sync {
    /// Appends a mutation, returning its sequence number.
    fn enqueue(&self, user_id: u64, op: PendingOp) -> u64;

    /// Returns all queued actions in FIFO order.
    fn snapshot(&self) -> Vec<PendingAction>;

    /// Removes the action with the given sequence number.
    ///
    /// Returns `false` if no such action is queued.
    fn remove(&self, seq: u64) -> bool;

    /// Drops all queued actions.
    fn clear(&self);

    /// Number of queued actions.
    fn len(&self) -> usize;

    /// Whether the queue is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory [`OfflineQueue`]. Contents are lost on process exit.
pub struct MemoryQueue {
    items: Mutex<Vec<PendingAction>>,
    next_seq: AtomicU64,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(1),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl OfflineQueue for MemoryQueue {
    fn enqueue(&self, user_id: u64, op: PendingOp) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(seq, user_id, op = op.name(), "action queued for replay");
        self.items.lock().push(PendingAction {
            seq,
            user_id,
            queued_at_ms: unix_millis(),
            op,
        });
        seq
    }

    fn snapshot(&self) -> Vec<PendingAction> {
        self.items.lock().clone()
    }

    fn remove(&self, seq: u64) -> bool {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|a| a.seq != seq);
        items.len() < before
    }

    fn clear(&self) {
        self.items.lock().clear();
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}
