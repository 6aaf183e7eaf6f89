//! Wire frames exchanged between `TaskSync` clients and the hub.
//!
//! Clients send [`ClientFrame`]s (a correlated remote call) and receive
//! [`ServerFrame`]s, which are either a [`CallReply`] correlated by
//! `request_id` or a pushed [`TaskEvent`]. All frames travel as
//! postcard-encoded WebSocket binary frames (see [`crate::codec`]).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{Task, TaskId};

/// Unique identifier for one WebSocket connection, assigned by the hub.
///
/// Push events carry the originating connection id so receivers can
/// distinguish self-originated changes from sibling-originated ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a new connection identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a connection identifier from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote call from a client to the hub.
///
/// Completion toggles have no dedicated wire call; clients send the
/// modified task as `UpdateTask`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubCall {
    /// Create a task. Replied with [`CallReply::TaskCreated`].
    AddTask(Task),
    /// Replace a task's fields (lock flag excluded). Last-writer-wins.
    UpdateTask(Task),
    /// Delete a task.
    DeleteTask {
        /// Owning user (must match the authenticated user).
        user_id: u64,
        /// Target task.
        task_id: TaskId,
    },
    /// Acquire the exclusive edit lock on a task.
    LockTask {
        /// Owning user (must match the authenticated user).
        user_id: u64,
        /// Target task.
        task_id: TaskId,
    },
    /// Release the exclusive edit lock on a task.
    UnlockTask {
        /// Owning user (must match the authenticated user).
        user_id: u64,
        /// Target task.
        task_id: TaskId,
    },
    /// Fetch all of a user's tasks.
    ListTasks {
        /// Owning user (must match the authenticated user).
        user_id: u64,
    },
}

impl HubCall {
    /// Short operation name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AddTask(_) => "add_task",
            Self::UpdateTask(_) => "update_task",
            Self::DeleteTask { .. } => "delete_task",
            Self::LockTask { .. } => "lock_task",
            Self::UnlockTask { .. } => "unlock_task",
            Self::ListTasks { .. } => "list_tasks",
        }
    }
}

/// A correlated client request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Client-chosen correlation id, echoed back in the reply.
    pub request_id: u64,
    /// The remote call.
    pub call: HubCall,
}

/// Errors the hub reports in a [`CallReply`].
///
/// These are the thrown half of the error taxonomy. Logical declines
/// (task not found, lock already held) are NOT errors; they come back
/// as `CallReply::Accepted(false)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallError {
    /// The call's user id does not match the authenticated connection.
    Unauthorized,
    /// The request is malformed (e.g. empty title).
    Malformed(String),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Malformed(reason) => write!(f, "malformed request: {reason}"),
        }
    }
}

/// The hub's reply to a [`HubCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallReply {
    /// The mutation was applied (`true`) or logically declined (`false`).
    Accepted(bool),
    /// `AddTask` succeeded; the canonical stored task.
    TaskCreated(Task),
    /// `ListTasks` result.
    Tasks(Vec<Task>),
    /// The call was rejected outright.
    Error(CallError),
}

/// A task mutation pushed to every connection in the owning user's group.
///
/// `sender` is the connection that originated the mutation, so a client
/// can optionally suppress the echo of its own change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEvent {
    /// A task was created.
    Added {
        /// The new task.
        task: Task,
        /// Originating connection.
        sender: ConnectionId,
    },
    /// A task's fields changed.
    Updated {
        /// The task after the update.
        task: Task,
        /// Originating connection.
        sender: ConnectionId,
    },
    /// A task was deleted.
    Deleted {
        /// The deleted task's id.
        task_id: TaskId,
        /// Originating connection.
        sender: ConnectionId,
    },
    /// A task's exclusive lock was acquired.
    Locked {
        /// The locked task's id.
        task_id: TaskId,
        /// Originating connection (the lock holder).
        sender: ConnectionId,
    },
    /// A task's exclusive lock was released.
    Unlocked {
        /// The unlocked task's id.
        task_id: TaskId,
        /// Originating connection.
        sender: ConnectionId,
    },
}

impl TaskEvent {
    /// The originating connection id.
    #[must_use]
    pub const fn sender(&self) -> ConnectionId {
        match self {
            Self::Added { sender, .. }
            | Self::Updated { sender, .. }
            | Self::Deleted { sender, .. }
            | Self::Locked { sender, .. }
            | Self::Unlocked { sender, .. } => *sender,
        }
    }

    /// The id of the task the event concerns.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        match self {
            Self::Added { task, .. } | Self::Updated { task, .. } => task.id,
            Self::Deleted { task_id, .. }
            | Self::Locked { task_id, .. }
            | Self::Unlocked { task_id, .. } => *task_id,
        }
    }
}

/// A frame from the hub to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Reply to a [`ClientFrame`], correlated by `request_id`.
    Reply {
        /// Correlation id from the originating request.
        request_id: u64,
        /// The call's outcome.
        reply: CallReply,
    },
    /// A pushed task mutation event.
    Event(TaskEvent),
}
