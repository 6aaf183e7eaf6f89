//! Offline-tolerant client wrapper.
//!
//! [`ResilientClient`] wraps any [`TaskChannel`] with an [`OfflineQueue`].
//! While the channel is connected, calls pass straight through. While it
//! is not, mutations are queued and acknowledged optimistically, and
//! reads return empty results. A background watcher observes status
//! transitions and replays the queue FIFO each time the channel comes
//! back up.
//!
//! Replay outcomes: a queued action the hub rejects is logged and
//! discarded; a transport failure stops the replay and retains the
//! remaining actions for the next reconnect.

use std::sync::Arc;

use tasksync_proto::task::{Task, TaskId};
use tasksync_proto::wire::TaskEvent;
use tokio::sync::{broadcast, watch};

use crate::channel::{ChannelError, ConnectionStatus, TaskChannel};
use crate::queue::{OfflineQueue, PendingOp};

/// Wraps a channel with store-and-forward queuing and optimistic
/// offline writes.
///
/// Dropping the client stops the replay watcher; queued actions stay in
/// the queue.
pub struct ResilientClient<C, Q> {
    channel: Arc<C>,
    queue: Arc<Q>,
    user_id: u64,
    watcher: Option<tokio::task::JoinHandle<()>>,
}

impl<C, Q> ResilientClient<C, Q>
where
    C: TaskChannel + 'static,
    Q: OfflineQueue + 'static,
{
    /// Creates the wrapper and starts the replay watcher.
    #[must_use]
    pub fn new(channel: Arc<C>, queue: Arc<Q>, user_id: u64) -> Self {
        let mut status_rx = channel.watch_status();
        let watcher_channel = Arc::clone(&channel);
        let watcher_queue = Arc::clone(&queue);
        // Serializes replays when status flaps faster than a drain.
        let replay_guard = Arc::new(tokio::sync::Mutex::new(()));

        let watcher = tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = *status_rx.borrow_and_update();
                if status == ConnectionStatus::Connected {
                    replay_queue(&*watcher_channel, &*watcher_queue, &replay_guard).await;
                }
            }
        });

        Self {
            channel,
            queue,
            user_id,
            watcher: Some(watcher),
        }
    }

    /// The wrapped channel.
    #[must_use]
    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    /// Number of actions awaiting replay.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    fn is_online(&self) -> bool {
        self.channel.status() == ConnectionStatus::Connected
    }

    /// Sets a task's completion flag, queuing the change while offline.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the hub rejects the update.
    pub async fn set_completion(
        &self,
        mut task: Task,
        completed: bool,
    ) -> Result<bool, ChannelError> {
        task.is_completed = completed;
        if self.is_online() {
            match self.channel.update_task(task.clone()).await {
                Ok(applied) => return Ok(applied),
                Err(e) if e.is_transport() => {
                    tracing::debug!(error = %e, "completion toggle failed mid-transition, queuing");
                }
                Err(e) => return Err(e),
            }
        }
        self.queue
            .enqueue(task.user_id, PendingOp::SetCompletion(task));
        Ok(true)
    }
}

impl<C, Q> TaskChannel for ResilientClient<C, Q>
where
    C: TaskChannel + 'static,
    Q: OfflineQueue + 'static,
{
    async fn connect(&self) -> Result<(), ChannelError> {
        self.channel.connect().await
    }

    async fn disconnect(&self) {
        self.channel.disconnect().await;
    }

    fn set_credential(&self, token: Option<String>) {
        self.channel.set_credential(token);
    }

    fn credential(&self) -> Option<String> {
        self.channel.credential()
    }

    /// Optimistic while offline: the submitted task is echoed back and
    /// queued for replay.
    async fn add_task(&self, task: Task) -> Result<Task, ChannelError> {
        if self.is_online() {
            match self.channel.add_task(task.clone()).await {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_transport() => {
                    tracing::debug!(error = %e, "add failed mid-transition, queuing");
                }
                Err(e) => return Err(e),
            }
        }
        self.queue.enqueue(task.user_id, PendingOp::Add(task.clone()));
        Ok(task)
    }

    async fn update_task(&self, task: Task) -> Result<bool, ChannelError> {
        if self.is_online() {
            match self.channel.update_task(task.clone()).await {
                Ok(applied) => return Ok(applied),
                Err(e) if e.is_transport() => {
                    tracing::debug!(error = %e, "update failed mid-transition, queuing");
                }
                Err(e) => return Err(e),
            }
        }
        self.queue.enqueue(task.user_id, PendingOp::Update(task));
        Ok(true)
    }

    async fn delete_task(&self, user_id: u64, task_id: TaskId) -> Result<bool, ChannelError> {
        if self.is_online() {
            match self.channel.delete_task(user_id, task_id).await {
                Ok(applied) => return Ok(applied),
                Err(e) if e.is_transport() => {
                    tracing::debug!(error = %e, "delete failed mid-transition, queuing");
                }
                Err(e) => return Err(e),
            }
        }
        self.queue.enqueue(user_id, PendingOp::Delete(task_id));
        Ok(true)
    }

    async fn lock_task(&self, user_id: u64, task_id: TaskId) -> Result<bool, ChannelError> {
        if self.is_online() {
            match self.channel.lock_task(user_id, task_id).await {
                Ok(acquired) => return Ok(acquired),
                Err(e) if e.is_transport() => {
                    tracing::debug!(error = %e, "lock failed mid-transition, queuing");
                }
                Err(e) => return Err(e),
            }
        }
        self.queue.enqueue(user_id, PendingOp::Lock(task_id));
        Ok(true)
    }

    async fn unlock_task(&self, user_id: u64, task_id: TaskId) -> Result<bool, ChannelError> {
        if self.is_online() {
            match self.channel.unlock_task(user_id, task_id).await {
                Ok(released) => return Ok(released),
                Err(e) if e.is_transport() => {
                    tracing::debug!(error = %e, "unlock failed mid-transition, queuing");
                }
                Err(e) => return Err(e),
            }
        }
        self.queue.enqueue(user_id, PendingOp::Unlock(task_id));
        Ok(true)
    }

    /// Reads have no offline fallback; an empty list is returned until
    /// connectivity resumes.
    async fn list_tasks(&self, user_id: u64) -> Result<Vec<Task>, ChannelError> {
        if self.is_online() {
            match self.channel.list_tasks(user_id).await {
                Ok(tasks) => return Ok(tasks),
                Err(e) if e.is_transport() => {
                    tracing::debug!(error = %e, "list failed mid-transition, empty result");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Vec::new())
    }

    fn status(&self) -> ConnectionStatus {
        self.channel.status()
    }

    fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.channel.watch_status()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.channel.subscribe_events()
    }
}

impl<C, Q> Drop for ResilientClient<C, Q> {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Drains the queue FIFO against the channel.
async fn replay_queue<C, Q>(channel: &C, queue: &Q, guard: &tokio::sync::Mutex<()>)
where
    C: TaskChannel,
    Q: OfflineQueue + ?Sized,
{
    let _lock = guard.lock().await;
    let actions = queue.snapshot();
    if actions.is_empty() {
        return;
    }
    tracing::info!(count = actions.len(), "replaying queued actions");

    for action in actions {
        match apply_op(channel, action.user_id, action.op.clone()).await {
            Ok(()) => {
                queue.remove(action.seq);
                tracing::debug!(seq = action.seq, op = action.op.name(), "action replayed");
            }
            Err(e) if e.is_transport() => {
                tracing::warn!(
                    seq = action.seq,
                    error = %e,
                    "replay interrupted, remaining actions retained"
                );
                break;
            }
            Err(e) => {
                tracing::warn!(
                    seq = action.seq,
                    op = action.op.name(),
                    error = %e,
                    "replayed action rejected, discarded"
                );
                queue.remove(action.seq);
            }
        }
    }
}

async fn apply_op<C: TaskChannel>(
    channel: &C,
    user_id: u64,
    op: PendingOp,
) -> Result<(), ChannelError> {
    match op {
        PendingOp::Add(task) => channel.add_task(task).await.map(|_| ()),
        PendingOp::Update(task) | PendingOp::SetCompletion(task) => {
            channel.update_task(task).await.map(|_| ())
        }
        PendingOp::Delete(task_id) => channel.delete_task(user_id, task_id).await.map(|_| ()),
        PendingOp::Lock(task_id) => channel.lock_task(user_id, task_id).await.map(|_| ()),
        PendingOp::Unlock(task_id) => channel.unlock_task(user_id, task_id).await.map(|_| ()),
    }
}
