//! Per-user convenience layer over a [`TaskChannel`].
//!
//! [`TaskAdapter`] tracks the tasks created through it, holds at most
//! one exclusive lock at a time, and can optionally auto-acquire the
//! lock on tasks the hub announces for its user. [`TaskAdapter::shutdown`]
//! releases a held lock exactly once.

use std::sync::Arc;

use tasksync_proto::task::{Task, TaskId};
use tasksync_proto::wire::TaskEvent;
use tokio::sync::broadcast;

use crate::channel::{ChannelError, TaskChannel};

struct AdapterState {
    /// Tasks created through this adapter, in creation order.
    owned: Vec<TaskId>,
    /// The task whose exclusive lock this adapter holds, if any.
    locked: Option<TaskId>,
}

/// Single-user task facade with lock bookkeeping.
pub struct TaskAdapter<C> {
    client: Arc<C>,
    user_id: u64,
    state: Arc<parking_lot::Mutex<AdapterState>>,
    event_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<C> TaskAdapter<C>
where
    C: TaskChannel + 'static,
{
    /// Creates an adapter for one user.
    ///
    /// With `auto_lock`, the event loop attempts to acquire the lock on
    /// every task the hub announces as added for this user, as long as
    /// no lock is currently held.
    #[must_use]
    pub fn new(client: Arc<C>, user_id: u64, auto_lock: bool) -> Self {
        let state = Arc::new(parking_lot::Mutex::new(AdapterState {
            owned: Vec::new(),
            locked: None,
        }));

        let mut events = client.subscribe_events();
        let loop_client = Arc::clone(&client);
        let loop_state = Arc::clone(&state);
        let event_task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        handle_event(&*loop_client, &loop_state, user_id, auto_lock, event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "adapter event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            client,
            user_id,
            state,
            event_task: parking_lot::Mutex::new(Some(event_task)),
        }
    }

    /// The user this adapter acts for.
    #[must_use]
    pub const fn user_id(&self) -> u64 {
        self.user_id
    }

    /// The task whose lock is currently held, if any.
    #[must_use]
    pub fn held_lock(&self) -> Option<TaskId> {
        self.state.lock().locked
    }

    /// Ids of the tasks created through this adapter, oldest first.
    #[must_use]
    pub fn owned_tasks(&self) -> Vec<TaskId> {
        self.state.lock().owned.clone()
    }

    /// Creates a task titled `title` for this adapter's user.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or hub rejection.
    pub async fn add_task(&self, title: impl Into<String> + Send) -> Result<Task, ChannelError> {
        let task = Task::new(self.user_id, title);
        let stored = self.client.add_task(task).await?;
        self.state.lock().owned.push(stored.id);
        Ok(stored)
    }

    /// Replaces a task's fields.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or hub rejection.
    pub async fn update_task(&self, task: Task) -> Result<bool, ChannelError> {
        self.client.update_task(task).await
    }

    /// Deletes a task. With no explicit target, the most recently
    /// created task is deleted; returns `Ok(false)` when there is
    /// nothing to delete.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or hub rejection.
    pub async fn delete_task(&self, target: Option<TaskId>) -> Result<bool, ChannelError> {
        let Some(task_id) = target.or_else(|| self.state.lock().owned.last().copied()) else {
            return Ok(false);
        };
        let deleted = self.client.delete_task(self.user_id, task_id).await?;
        if deleted {
            let mut state = self.state.lock();
            state.owned.retain(|id| *id != task_id);
            if state.locked == Some(task_id) {
                state.locked = None;
            }
        }
        Ok(deleted)
    }

    /// Acquires a task's exclusive lock. With no explicit target, the
    /// most recently created task is locked.
    ///
    /// Declined locally with `Ok(false)` if this adapter already holds
    /// a lock or there is no candidate task; at most one lock is held
    /// at a time.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or hub rejection.
    pub async fn lock_task(&self, target: Option<TaskId>) -> Result<bool, ChannelError> {
        let task_id = {
            let state = self.state.lock();
            if state.locked.is_some() {
                return Ok(false);
            }
            match target.or_else(|| state.owned.last().copied()) {
                Some(id) => id,
                None => return Ok(false),
            }
        };
        let acquired = self.client.lock_task(self.user_id, task_id).await?;
        if acquired {
            let raced = {
                let mut state = self.state.lock();
                if state.locked.is_none() {
                    state.locked = Some(task_id);
                    false
                } else {
                    true
                }
            };
            // A concurrent lock_task won while this call was in flight;
            // give the second server-side lock back.
            if raced {
                if !matches!(self.client.unlock_task(self.user_id, task_id).await, Ok(true)) {
                    tracing::warn!(task_id = %task_id, "failed to release redundant lock");
                }
                return Ok(false);
            }
        }
        Ok(acquired)
    }

    /// Releases the held lock, if any. The local lock record is cleared
    /// only once the hub has answered; a transport failure keeps it so a
    /// later release can still reach the server-side lock.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or hub rejection.
    pub async fn unlock(&self) -> Result<bool, ChannelError> {
        let Some(task_id) = self.state.lock().locked else {
            return Ok(false);
        };
        let released = self.client.unlock_task(self.user_id, task_id).await?;
        let mut state = self.state.lock();
        if state.locked == Some(task_id) {
            state.locked = None;
        }
        Ok(released)
    }

    /// Stops the event loop and releases a held lock exactly once.
    ///
    /// Safe to call repeatedly; later calls are no-ops. If the release
    /// fails in transit the lock record is restored, so a retry still
    /// knows what it owes the server.
    pub async fn shutdown(&self) {
        let handle = self.event_task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let held = self.state.lock().locked.take();
        if let Some(task_id) = held {
            if let Err(e) = self.client.unlock_task(self.user_id, task_id).await {
                tracing::warn!(task_id = %task_id, error = %e, "failed to release lock on shutdown");
                let mut state = self.state.lock();
                if state.locked.is_none() {
                    state.locked = Some(task_id);
                }
            }
        }
    }
}

impl<C> Drop for TaskAdapter<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.event_task.lock().take() {
            handle.abort();
        }
        if let Some(task_id) = self.state.lock().locked {
            tracing::warn!(task_id = %task_id, "adapter dropped while holding a lock");
        }
    }
}

async fn handle_event<C: TaskChannel>(
    client: &C,
    state: &Arc<parking_lot::Mutex<AdapterState>>,
    user_id: u64,
    auto_lock: bool,
    event: TaskEvent,
) {
    match event {
        TaskEvent::Added { task, .. } if task.user_id == user_id => {
            let should_lock = auto_lock && state.lock().locked.is_none();
            if !should_lock {
                return;
            }
            match client.lock_task(user_id, task.id).await {
                Ok(true) => {
                    let raced = {
                        let mut s = state.lock();
                        if s.locked.is_none() {
                            s.locked = Some(task.id);
                            false
                        } else {
                            true
                        }
                    };
                    // Lost a race against an explicit lock; give it back.
                    if raced && !matches!(client.unlock_task(user_id, task.id).await, Ok(true)) {
                        tracing::warn!(task_id = %task.id, "failed to release redundant auto-lock");
                    }
                }
                Ok(false) => {
                    tracing::debug!(task_id = %task.id, "auto-lock declined, task already locked");
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "auto-lock attempt failed");
                }
            }
        }
        TaskEvent::Deleted { task_id, .. } => {
            let mut s = state.lock();
            s.owned.retain(|id| *id != task_id);
            if s.locked == Some(task_id) {
                s.locked = None;
            }
        }
        TaskEvent::Unlocked { task_id, .. } => {
            // Server-side release observed (e.g. replayed from a sibling).
            let mut s = state.lock();
            if s.locked == Some(task_id) {
                s.locked = None;
            }
        }
        _ => {}
    }
}
