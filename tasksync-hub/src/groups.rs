//! Per-user connection group registry and broadcast routing.
//!
//! Every authenticated connection joins the group of its owning user;
//! pushed [`ServerFrame`]s are delivered to all members of that group.
//! Group membership is ephemeral -- lost on hub restart, rebuilt as
//! connections re-establish.
//!
//! Invariant: a connection id is a member of at most one group at a
//! time, enforced by removing it from every group before (re)inserting.

use std::collections::HashMap;

use axum::extract::ws::Message;
use tasksync_proto::codec;
use tasksync_proto::wire::{ConnectionId, ServerFrame};
use tokio::sync::{RwLock, mpsc};

/// Registry mapping each user id to the set of that user's live
/// connections, each represented by the sender half of its WebSocket
/// writer channel.
///
/// An owned, injectable component: every hub instance (and every test)
/// gets its own isolated membership table, guarded by one [`RwLock`].
pub struct GroupRouter {
    groups: RwLock<HashMap<u64, HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>>,
}

impl Default for GroupRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupRouter {
    /// Creates a new, empty group router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a connection to its user's group.
    ///
    /// The connection is first removed from every group, so a reconnect
    /// that reuses a connection id can never leave a stale membership
    /// behind.
    pub async fn join(
        &self,
        user_id: u64,
        conn_id: ConnectionId,
        sender: mpsc::UnboundedSender<Message>,
    ) {
        let mut groups = self.groups.write().await;
        for members in groups.values_mut() {
            members.remove(&conn_id);
        }
        groups.entry(user_id).or_default().insert(conn_id, sender);
    }

    /// Removes a connection from every group.
    ///
    /// Returns `true` if the connection was a member of any group.
    /// Empty groups are dropped so the table does not grow unboundedly.
    pub async fn leave(&self, conn_id: ConnectionId) -> bool {
        let mut groups = self.groups.write().await;
        let mut removed = false;
        groups.retain(|_, members| {
            removed |= members.remove(&conn_id).is_some();
            !members.is_empty()
        });
        removed
    }

    /// Sends a frame to every member of a user's group.
    ///
    /// Delivery is fire-and-forget: an empty group or a closed member
    /// channel is logged and skipped, never surfaced to the caller.
    /// Returns the number of members the frame was handed to.
    pub async fn broadcast(&self, user_id: u64, frame: &ServerFrame) -> usize {
        let bytes = match codec::encode_server(frame) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode broadcast frame");
                return 0;
            }
        };

        let groups = self.groups.read().await;
        let Some(members) = groups.get(&user_id) else {
            tracing::debug!(user_id, "no connections in group, broadcast dropped");
            return 0;
        };

        let mut delivered = 0;
        for (conn_id, sender) in members {
            if sender.send(Message::Binary(bytes.clone().into())).is_ok() {
                delivered += 1;
            } else {
                // Writer task already exited; the reader side will call
                // leave() when the socket closes.
                tracing::debug!(conn_id = %conn_id, "member channel closed, skipping");
            }
        }
        delivered
    }

    /// Returns the group a connection currently belongs to, if any.
    pub async fn group_of(&self, conn_id: ConnectionId) -> Option<u64> {
        let groups = self.groups.read().await;
        groups
            .iter()
            .find(|(_, members)| members.contains_key(&conn_id))
            .map(|(user_id, _)| *user_id)
    }

    /// Returns the number of connections in a user's group.
    pub async fn member_count(&self, user_id: u64) -> usize {
        let groups = self.groups.read().await;
        groups.get(&user_id).map_or(0, HashMap::len)
    }
}
