//! Task model shared by the `TaskSync` hub and clients.
//!
//! The canonical copy of every [`Task`] lives on the hub; clients hold
//! working copies delivered through push events or `ListTasks` queries.
//! Conflict resolution between concurrent writers is last-writer-wins.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed task title length in characters.
pub const MAX_TITLE_LENGTH: usize = 256;

/// Unique identifier for a task, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new time-ordered task identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `TaskId` from an existing UUID.
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

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task priority level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Can wait.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Needs attention soon.
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A task in a user's shared list.
///
/// `is_locked` is the exclusive-edit flag arbitrated by the hub: at most
/// one connection may hold it at a time, and it only changes through the
/// `LockTask`/`UnlockTask` calls, never through `UpdateTask`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier (UUID v7, time-ordered).
    pub id: TaskId,
    /// Owning user. All of this user's connections receive change events.
    pub user_id: u64,
    /// Task title. Never empty; at most [`MAX_TITLE_LENGTH`] characters.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Whether the task has been completed.
    pub is_completed: bool,
    /// Exclusive edit lock flag, owned by the hub.
    pub is_locked: bool,
    /// Priority level.
    pub priority: Priority,
    /// Optional due date, milliseconds since epoch.
    pub due_date: Option<u64>,
    /// Free-form tags.
    pub tags: Vec<String>,
}

impl Task {
    /// Creates a new unlocked, uncompleted task with a fresh id.
    #[must_use]
    pub fn new(user_id: u64, title: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            user_id,
            title: title.into(),
            description: String::new(),
            is_completed: false,
            is_locked: false,
            priority: Priority::Normal,
            due_date: None,
            tags: Vec::new(),
        }
    }
}
