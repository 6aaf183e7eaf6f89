//! Channel layer abstraction for the `TaskSync` client.
//!
//! Defines the [`TaskChannel`] trait all channel implementations must
//! satisfy. Concrete implementations:
//! - [`loopback::LoopbackChannel`] -- in-process recording channel for testing
//! - [`ws::WsChannel`] -- WebSocket channel to a hub, with reconnection

pub mod loopback;
pub mod ws;

use std::fmt;

use tasksync_proto::task::{Task, TaskId};
use tasksync_proto::wire::TaskEvent;
use tokio::sync::{broadcast, watch};

/// Lifecycle state of a channel's connection to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Initial connection attempt in progress.
    Connecting,
    /// Live connection established.
    Connected,
    /// Connection lost; reconnection attempts in progress.
    Reconnecting,
    /// Not connected and not trying (initial state, or after a
    /// voluntary disconnect).
    #[default]
    Disconnected,
    /// Reconnection attempts exhausted; a new `connect` is required.
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Errors that can occur during channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// No live connection to the hub.
    #[error("not connected to hub")]
    NotConnected,

    /// The operation timed out before completing.
    #[error("channel operation timed out")]
    Timeout,

    /// The hub refused the connection or the call for this identity.
    #[error("unauthorized")]
    Unauthorized,

    /// The hub reported a protocol-level problem with the call.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An underlying I/O error occurred.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Whether the error is a transport failure (the call never reached
    /// the hub), as opposed to a rejection the hub issued.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Timeout | Self::Io(_))
    }
}

/// Async channel trait for task calls against a hub.
///
/// All mutating calls return `Ok(true)` when applied and `Ok(false)`
/// when logically declined (absent task, lock already held). `Err` is
/// reserved for transport failures and hub rejections.
pub trait TaskChannel: Send + Sync {
    /// Establish the connection. Idempotent: an existing connection is
    /// torn down first.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unauthorized`] if the hub refuses the
    /// credential, [`ChannelError::Timeout`] if the attempt times out.
    fn connect(&self) -> impl std::future::Future<Output = Result<(), ChannelError>> + Send;

    /// Tear down the connection and stop any reconnection attempts.
    fn disconnect(&self) -> impl std::future::Future<Output = ()> + Send;

    /// Sets the credential presented on the next connection attempt.
    fn set_credential(&self, token: Option<String>);

    /// The currently configured credential, if any.
    fn credential(&self) -> Option<String>;

    /// Create a task. Returns the canonical stored task.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or hub rejection.
    fn add_task(
        &self,
        task: Task,
    ) -> impl std::future::Future<Output = Result<Task, ChannelError>> + Send;

    /// Replace a task's fields.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or hub rejection.
    fn update_task(
        &self,
        task: Task,
    ) -> impl std::future::Future<Output = Result<bool, ChannelError>> + Send;

    /// Delete a task.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or hub rejection.
    fn delete_task(
        &self,
        user_id: u64,
        task_id: TaskId,
    ) -> impl std::future::Future<Output = Result<bool, ChannelError>> + Send;

    /// Acquire the exclusive edit lock on a task.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or hub rejection.
    fn lock_task(
        &self,
        user_id: u64,
        task_id: TaskId,
    ) -> impl std::future::Future<Output = Result<bool, ChannelError>> + Send;

    /// Release the exclusive edit lock on a task.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or hub rejection.
    fn unlock_task(
        &self,
        user_id: u64,
        task_id: TaskId,
    ) -> impl std::future::Future<Output = Result<bool, ChannelError>> + Send;

    /// Fetch all of a user's tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or hub rejection.
    fn list_tasks(
        &self,
        user_id: u64,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, ChannelError>> + Send;

    /// Current connection status.
    fn status(&self) -> ConnectionStatus;

    /// Watch receiver notified on every status transition.
    fn watch_status(&self) -> watch::Receiver<ConnectionStatus>;

    /// Subscribe to task events pushed by the hub.
    fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent>;
}
