//! In-process loopback channel for testing.
//!
//! Implements [`TaskChannel`] against an in-memory task table, recording
//! every call it receives. Tests drive connectivity transitions with
//! [`LoopbackChannel::set_online`] and inject pushed events with
//! [`LoopbackChannel::emit`]; local mutations do not emit events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tasksync_proto::task::{Task, TaskId};
use tasksync_proto::wire::{HubCall, TaskEvent};
use tokio::sync::{broadcast, watch};

use super::{ChannelError, ConnectionStatus, TaskChannel};

/// Capacity of the injected-event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Recording in-memory channel. Starts offline.
pub struct LoopbackChannel {
    online: AtomicBool,
    reject: AtomicBool,
    latency: Mutex<Option<Duration>>,
    credential: Mutex<Option<String>>,
    calls: Mutex<Vec<HubCall>>,
    tasks: Mutex<HashMap<TaskId, Task>>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<TaskEvent>,
}

impl Default for LoopbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackChannel {
    /// Creates an offline loopback channel with an empty task table.
    #[must_use]
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            online: AtomicBool::new(false),
            reject: AtomicBool::new(false),
            latency: Mutex::new(None),
            credential: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
            status,
            events,
        }
    }

    /// Flips connectivity, publishing the matching status transition.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
        self.status.send_replace(if online {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        });
    }

    /// Publishes an arbitrary status without changing connectivity.
    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    /// When set, every mutation is rejected with a protocol error.
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::Relaxed);
    }

    /// Adds an artificial delay to every call, so tests can hold
    /// several calls in flight at once.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// All calls received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<HubCall> {
        self.calls.lock().clone()
    }

    /// Snapshot of the in-memory task table.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().values().cloned().collect()
    }

    /// Injects a pushed event, as if the hub broadcast it.
    pub fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_usable(&self) -> Result<(), ChannelError> {
        if !self.online.load(Ordering::Relaxed) {
            return Err(ChannelError::NotConnected);
        }
        if self.reject.load(Ordering::Relaxed) {
            return Err(ChannelError::Protocol("rejected by test channel".to_string()));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl TaskChannel for LoopbackChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        self.set_online(true);
        Ok(())
    }

    async fn disconnect(&self) {
        self.set_online(false);
    }

    fn set_credential(&self, token: Option<String>) {
        *self.credential.lock() = token;
    }

    fn credential(&self) -> Option<String> {
        self.credential.lock().clone()
    }

    async fn add_task(&self, mut task: Task) -> Result<Task, ChannelError> {
        self.ensure_usable()?;
        self.simulate_latency().await;
        self.calls.lock().push(HubCall::AddTask(task.clone()));
        task.is_locked = false;
        self.tasks.lock().insert(task.id, task.clone());
        Ok(task)
    }

    async fn update_task(&self, task: Task) -> Result<bool, ChannelError> {
        self.ensure_usable()?;
        self.simulate_latency().await;
        self.calls.lock().push(HubCall::UpdateTask(task.clone()));
        let mut tasks = self.tasks.lock();
        let Some(existing) = tasks.get_mut(&task.id) else {
            return Ok(false);
        };
        let is_locked = existing.is_locked;
        *existing = task;
        existing.is_locked = is_locked;
        Ok(true)
    }

    async fn delete_task(&self, user_id: u64, task_id: TaskId) -> Result<bool, ChannelError> {
        self.ensure_usable()?;
        self.simulate_latency().await;
        self.calls
            .lock()
            .push(HubCall::DeleteTask { user_id, task_id });
        Ok(self.tasks.lock().remove(&task_id).is_some())
    }

    async fn lock_task(&self, user_id: u64, task_id: TaskId) -> Result<bool, ChannelError> {
        self.ensure_usable()?;
        self.simulate_latency().await;
        self.calls.lock().push(HubCall::LockTask { user_id, task_id });
        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if task.is_locked {
            return Ok(false);
        }
        task.is_locked = true;
        Ok(true)
    }

    async fn unlock_task(&self, user_id: u64, task_id: TaskId) -> Result<bool, ChannelError> {
        self.ensure_usable()?;
        self.simulate_latency().await;
        self.calls
            .lock()
            .push(HubCall::UnlockTask { user_id, task_id });
        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if !task.is_locked {
            return Ok(false);
        }
        task.is_locked = false;
        Ok(true)
    }

    async fn list_tasks(&self, user_id: u64) -> Result<Vec<Task>, ChannelError> {
        self.ensure_usable()?;
        self.simulate_latency().await;
        self.calls.lock().push(HubCall::ListTasks { user_id });
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| *t.id.as_uuid());
        Ok(tasks)
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }
}
