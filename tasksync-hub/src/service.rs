//! Canonical task store and mutation service for the hub.
//!
//! Every mutation happens under the store's single write lock and emits
//! a [`TaskChange`] domain event on a broadcast channel; the relay task
//! in [`crate::hub`] turns those into wire pushes. Lock acquisition is a
//! conditional update under the same write lock, which is what makes
//! concurrent client-side lock attempts safe: exactly one caller can
//! flip `is_locked` from false to true.

use std::collections::HashMap;

use tasksync_proto::task::{MAX_TITLE_LENGTH, Task, TaskId};
use tasksync_proto::wire::ConnectionId;
use tokio::sync::{RwLock, broadcast};

/// Capacity of the domain event channel. A lagging relay drops the
/// oldest events rather than blocking mutations.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Malformed-request errors. Thrown, unlike logical declines (absent
/// task, lock already held) which are reported as `Ok(false)`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Task title cannot be empty.
    #[error("task title cannot be empty")]
    TitleEmpty,
    /// Task title exceeds the maximum length.
    #[error("task title too long (max {MAX_TITLE_LENGTH} characters)")]
    TitleTooLong,
}

/// A task mutation that was applied to the canonical store.
///
/// Add/update carry the full task; delete/lock/unlock carry only the id
/// (the owning user is resolved via [`TaskService::owner_of`]). Every
/// variant records the originating connection so the relay can tag the
/// wire event with it.
#[derive(Debug, Clone)]
pub enum TaskChange {
    /// A task was created.
    Added {
        /// The stored task.
        task: Task,
        /// Originating connection.
        origin: ConnectionId,
    },
    /// A task's fields were replaced.
    Updated {
        /// The task after the update.
        task: Task,
        /// Originating connection.
        origin: ConnectionId,
    },
    /// A task was removed.
    Deleted {
        /// The removed task's id.
        task_id: TaskId,
        /// Originating connection.
        origin: ConnectionId,
    },
    /// A task's exclusive lock was acquired.
    Locked {
        /// The locked task's id.
        task_id: TaskId,
        /// Originating connection.
        origin: ConnectionId,
    },
    /// A task's exclusive lock was released.
    Unlocked {
        /// The unlocked task's id.
        task_id: TaskId,
        /// Originating connection.
        origin: ConnectionId,
    },
}

struct Store {
    tasks: HashMap<TaskId, Task>,
    /// Task id -> owning user, retained after delete so the relay can
    /// still resolve the owner for id-only events. Never pruned, so it
    /// grows with every task ever created for the lifetime of the
    /// process; bounding it would require pruning an entry once its
    /// delete event has been relayed to the last subscriber.
    owners: HashMap<TaskId, u64>,
}

/// In-memory canonical task store with conditional lock updates.
pub struct TaskService {
    store: RwLock<Store>,
    changes: broadcast::Sender<TaskChange>,
}

impl Default for TaskService {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskService {
    /// Creates an empty task service.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store: RwLock::new(Store {
                tasks: HashMap::new(),
                owners: HashMap::new(),
            }),
            changes,
        }
    }

    /// Subscribes to the domain event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskChange> {
        self.changes.subscribe()
    }

    fn validate_title(title: &str) -> Result<(), ServiceError> {
        if title.is_empty() {
            return Err(ServiceError::TitleEmpty);
        }
        if title.chars().count() > MAX_TITLE_LENGTH {
            return Err(ServiceError::TitleTooLong);
        }
        Ok(())
    }

    fn emit(&self, change: TaskChange) {
        // No subscribers is fine; the relay may not be running in tests.
        let _ = self.changes.send(change);
    }

    /// Creates a task and emits [`TaskChange::Added`].
    ///
    /// The stored task is always created unlocked; clients cannot smuggle
    /// a pre-locked task past the lock arbiter.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::TitleEmpty`] or [`ServiceError::TitleTooLong`].
    pub async fn add_task(
        &self,
        mut task: Task,
        origin: ConnectionId,
    ) -> Result<Task, ServiceError> {
        Self::validate_title(&task.title)?;
        task.is_locked = false;

        let mut store = self.store.write().await;
        store.owners.insert(task.id, task.user_id);
        store.tasks.insert(task.id, task.clone());
        drop(store);

        tracing::debug!(task_id = %task.id, user_id = task.user_id, "task added");
        self.emit(TaskChange::Added {
            task: task.clone(),
            origin,
        });
        Ok(task)
    }

    /// Replaces a task's fields, last-writer-wins. The server-side lock
    /// flag is preserved; lock state changes only via lock/unlock.
    ///
    /// Returns `Ok(false)` if the task does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::TitleEmpty`] or [`ServiceError::TitleTooLong`].
    pub async fn update_task(
        &self,
        mut task: Task,
        origin: ConnectionId,
    ) -> Result<bool, ServiceError> {
        Self::validate_title(&task.title)?;

        let mut store = self.store.write().await;
        let Some(existing) = store.tasks.get_mut(&task.id) else {
            return Ok(false);
        };
        task.is_locked = existing.is_locked;
        task.user_id = existing.user_id;
        *existing = task.clone();
        drop(store);

        tracing::debug!(task_id = %task.id, "task updated");
        self.emit(TaskChange::Updated { task, origin });
        Ok(true)
    }

    /// Removes a task, retaining its owner tombstone.
    ///
    /// Returns `false` if the task does not exist.
    pub async fn delete_task(&self, task_id: TaskId, origin: ConnectionId) -> bool {
        let mut store = self.store.write().await;
        if store.tasks.remove(&task_id).is_none() {
            return false;
        }
        drop(store);

        tracing::debug!(task_id = %task_id, "task deleted");
        self.emit(TaskChange::Deleted { task_id, origin });
        true
    }

    /// Acquires the exclusive lock: sets `is_locked = true` only if it
    /// is currently false. The single write lock serializes concurrent
    /// attempts, so exactly one of N racing callers succeeds.
    ///
    /// Returns `false` if the task is absent or already locked.
    pub async fn lock_task(&self, task_id: TaskId, origin: ConnectionId) -> bool {
        let mut store = self.store.write().await;
        let Some(task) = store.tasks.get_mut(&task_id) else {
            return false;
        };
        if task.is_locked {
            return false;
        }
        task.is_locked = true;
        drop(store);

        tracing::debug!(task_id = %task_id, conn_id = %origin, "task locked");
        self.emit(TaskChange::Locked { task_id, origin });
        true
    }

    /// Releases the exclusive lock: sets `is_locked = false` only if it
    /// is currently true.
    ///
    /// Returns `false` if the task is absent or not locked.
    pub async fn unlock_task(&self, task_id: TaskId, origin: ConnectionId) -> bool {
        let mut store = self.store.write().await;
        let Some(task) = store.tasks.get_mut(&task_id) else {
            return false;
        };
        if !task.is_locked {
            return false;
        }
        task.is_locked = false;
        drop(store);

        tracing::debug!(task_id = %task_id, conn_id = %origin, "task unlocked");
        self.emit(TaskChange::Unlocked { task_id, origin });
        true
    }

    /// Returns all of a user's tasks, sorted by id (creation order,
    /// since ids are time-ordered).
    pub async fn list_tasks(&self, user_id: u64) -> Vec<Task> {
        let store = self.store.read().await;
        let mut tasks: Vec<Task> = store
            .tasks
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| *t.id.as_uuid());
        tasks
    }

    /// Resolves the owning user of a task, including deleted tasks
    /// (owner tombstones survive deletion).
    pub async fn owner_of(&self, task_id: TaskId) -> Option<u64> {
        let store = self.store.read().await;
        store.owners.get(&task_id).copied()
    }

    /// Returns a task snapshot, if it exists.
    pub async fn get_task(&self, task_id: TaskId) -> Option<Task> {
        let store = self.store.read().await;
        store.tasks.get(&task_id).cloned()
    }
}
