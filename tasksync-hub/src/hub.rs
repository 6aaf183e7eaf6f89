//! Hub core: shared state, WebSocket handler, call dispatch, and the
//! broadcast relay task.
//!
//! The hub accepts WebSocket connections at `/ws`, refuses them with
//! `401` unless a valid token is presented, and joins each accepted
//! connection to its user's group. Calls decoded from the socket are
//! applied to the [`TaskService`]; the relay task turns the resulting
//! [`TaskChange`]s into [`TaskEvent`] pushes delivered to every
//! connection in the owning user's group.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use tasksync_proto::codec;
use tasksync_proto::wire::{
    CallError, CallReply, ClientFrame, ConnectionId, HubCall, ServerFrame, TaskEvent,
};
use tokio::sync::{broadcast, mpsc};

use crate::auth::{self, TokenValidator};
use crate::groups::GroupRouter;
use crate::service::{TaskChange, TaskService};

/// Default maximum allowed frame size in bytes (64 KB).
const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Shared hub state: group routing, the canonical task store, and the
/// connection gate's validator.
pub struct HubState {
    /// Per-user connection groups.
    pub router: GroupRouter,
    /// Canonical task store.
    pub service: TaskService,
    validator: Arc<dyn TokenValidator>,
    max_frame_size: usize,
}

impl HubState {
    /// Creates hub state with the default frame size limit.
    #[must_use]
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self::with_config(validator, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates hub state with a custom frame size limit.
    #[must_use]
    pub fn with_config(validator: Arc<dyn TokenValidator>, max_frame_size: usize) -> Self {
        Self {
            router: GroupRouter::new(),
            service: TaskService::new(),
            validator,
            max_frame_size,
        }
    }
}

/// axum handler that gates and upgrades an HTTP request to a WebSocket
/// connection.
///
/// The credential is taken from the `token` query parameter or an
/// `Authorization: Bearer` header; a missing or invalid token refuses
/// the connection with `401 Unauthorized` before any upgrade happens.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    uri: axum::http::Uri,
    headers: axum::http::HeaderMap,
    axum::extract::State(state): axum::extract::State<Arc<HubState>>,
) -> axum::response::Response {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    let token = auth::extract_token(uri.query(), authorization);

    let Some(user_id) = auth::authenticate(state.validator.as_ref(), token.as_deref()) else {
        tracing::warn!("connection refused: missing or invalid token");
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
        .into_response()
}

/// Handles an upgraded, authenticated WebSocket connection.
///
/// The connection lifecycle:
/// 1. Assign a fresh [`ConnectionId`] and join the user's group.
/// 2. Spawn a writer task draining the connection's outbound channel.
/// 3. Read frames, dispatching each call and replying on the channel.
/// 4. On disconnect, leave the group.
pub async fn handle_socket(socket: WebSocket, state: Arc<HubState>, user_id: u64) {
    let conn_id = ConnectionId::new();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.router.join(user_id, conn_id, tx.clone()).await;
    tracing::info!(conn_id = %conn_id, user_id, "connection joined group");

    let mut write_task = tokio::spawn(async move {
        use futures_util::SinkExt;
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!("WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_frame(&reader_state, conn_id, user_id, &data, &tx).await;
                }
                Message::Close(_) => {
                    tracing::info!(conn_id = %conn_id, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    // Wait for either task to finish, then abort the other.
    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.router.leave(conn_id).await;
    tracing::info!(conn_id = %conn_id, user_id, "connection left group");
}

/// Decodes one binary frame, dispatches the call, and queues the reply.
///
/// Undecodable or oversized frames are logged and dropped; with no
/// trustworthy `request_id` there is nothing to correlate a reply to.
async fn handle_binary_frame(
    state: &Arc<HubState>,
    conn_id: ConnectionId,
    user_id: u64,
    data: &[u8],
    out: &mpsc::UnboundedSender<Message>,
) {
    if data.len() > state.max_frame_size {
        tracing::warn!(
            conn_id = %conn_id,
            size = data.len(),
            max = state.max_frame_size,
            "frame exceeds size limit, dropped"
        );
        return;
    }

    let frame = match codec::decode_client(data) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(conn_id = %conn_id, error = %e, "failed to decode frame, dropped");
            return;
        }
    };

    tracing::debug!(
        conn_id = %conn_id,
        request_id = frame.request_id,
        call = frame.call.name(),
        "dispatching call"
    );

    let reply = dispatch_call(state, conn_id, user_id, frame.call).await;
    let server_frame = ServerFrame::Reply {
        request_id: frame.request_id,
        reply,
    };
    match codec::encode_server(&server_frame) {
        Ok(bytes) => {
            let _ = out.send(Message::Binary(bytes.into()));
        }
        Err(e) => {
            tracing::error!(conn_id = %conn_id, error = %e, "failed to encode reply");
        }
    }
}

/// Applies one call to the task service and builds its reply.
///
/// Every call names an owning user; a mismatch with the connection's
/// authenticated identity is rejected with [`CallError::Unauthorized`]
/// before the store is touched.
async fn dispatch_call(
    state: &Arc<HubState>,
    conn_id: ConnectionId,
    user_id: u64,
    call: HubCall,
) -> CallReply {
    let call_user = match &call {
        HubCall::AddTask(task) | HubCall::UpdateTask(task) => task.user_id,
        HubCall::DeleteTask { user_id, .. }
        | HubCall::LockTask { user_id, .. }
        | HubCall::UnlockTask { user_id, .. }
        | HubCall::ListTasks { user_id } => *user_id,
    };
    if call_user != user_id {
        tracing::warn!(
            conn_id = %conn_id,
            user_id,
            call_user,
            call = call.name(),
            "call names a different user, rejected"
        );
        return CallReply::Error(CallError::Unauthorized);
    }

    match call {
        HubCall::AddTask(task) => match state.service.add_task(task, conn_id).await {
            Ok(stored) => CallReply::TaskCreated(stored),
            Err(e) => CallReply::Error(CallError::Malformed(e.to_string())),
        },
        HubCall::UpdateTask(task) => match state.service.update_task(task, conn_id).await {
            Ok(applied) => CallReply::Accepted(applied),
            Err(e) => CallReply::Error(CallError::Malformed(e.to_string())),
        },
        HubCall::DeleteTask { task_id, .. } => {
            CallReply::Accepted(state.service.delete_task(task_id, conn_id).await)
        }
        HubCall::LockTask { task_id, .. } => {
            CallReply::Accepted(state.service.lock_task(task_id, conn_id).await)
        }
        HubCall::UnlockTask { task_id, .. } => {
            CallReply::Accepted(state.service.unlock_task(task_id, conn_id).await)
        }
        HubCall::ListTasks { user_id } => {
            CallReply::Tasks(state.service.list_tasks(user_id).await)
        }
    }
}

/// Spawns the broadcast relay: for every [`TaskChange`] emitted by the
/// task service, resolves the owning user and pushes a [`TaskEvent`] to
/// that user's group.
///
/// The receiver is subscribed before the task is spawned, so no change
/// emitted after this call returns can be missed.
pub fn spawn_broadcast_relay(state: Arc<HubState>) -> tokio::task::JoinHandle<()> {
    let mut changes = state.service.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => relay_change(&state, change).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "broadcast relay lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Maps one domain change to a wire event and broadcasts it to the
/// owning user's group.
async fn relay_change(state: &Arc<HubState>, change: TaskChange) {
    let (owner, event) = match change {
        TaskChange::Added { task, origin } => (
            task.user_id,
            TaskEvent::Added {
                task,
                sender: origin,
            },
        ),
        TaskChange::Updated { task, origin } => (
            task.user_id,
            TaskEvent::Updated {
                task,
                sender: origin,
            },
        ),
        TaskChange::Deleted { task_id, origin } => {
            let Some(owner) = state.service.owner_of(task_id).await else {
                tracing::warn!(task_id = %task_id, "no owner for deleted task, event dropped");
                return;
            };
            (
                owner,
                TaskEvent::Deleted {
                    task_id,
                    sender: origin,
                },
            )
        }
        TaskChange::Locked { task_id, origin } => {
            let Some(owner) = state.service.owner_of(task_id).await else {
                tracing::warn!(task_id = %task_id, "no owner for locked task, event dropped");
                return;
            };
            (
                owner,
                TaskEvent::Locked {
                    task_id,
                    sender: origin,
                },
            )
        }
        TaskChange::Unlocked { task_id, origin } => {
            let Some(owner) = state.service.owner_of(task_id).await else {
                tracing::warn!(task_id = %task_id, "no owner for unlocked task, event dropped");
                return;
            };
            (
                owner,
                TaskEvent::Unlocked {
                    task_id,
                    sender: origin,
                },
            )
        }
    };

    let delivered = state
        .router
        .broadcast(owner, &ServerFrame::Event(event))
        .await;
    tracing::debug!(user_id = owner, delivered, "event broadcast");
}

/// Starts the hub on the given address and returns the bound address
/// and a join handle.
///
/// The broadcast relay task is started alongside the server.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
    validator: Arc<dyn TokenValidator>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(HubState::new(validator))).await
}

/// Starts the hub with a pre-configured [`HubState`].
///
/// Use [`HubState::with_config`] to apply limits from the resolved
/// [`crate::config::HubConfig`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<HubState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let _relay = spawn_broadcast_relay(Arc::clone(&state));

    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "hub server error");
        }
    });

    Ok((bound_addr, handle))
}
