//! WebSocket channel to a `TaskSync` hub.
//!
//! Implements the [`TaskChannel`] trait over a WebSocket connection.
//! Calls are correlated by `request_id` through a pending-reply map; a
//! background connection task reads frames, resolves replies, and fans
//! pushed events out to subscribers. When the connection drops, the
//! task transitions to `Reconnecting` and retries with exponential
//! backoff until it succeeds or the attempt budget is exhausted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tasksync_proto::codec;
use tasksync_proto::task::{Task, TaskId};
use tasksync_proto::wire::{CallError, CallReply, ClientFrame, HubCall, ServerFrame, TaskEvent};
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::config::{ChannelConfig, ReconnectConfig};

use super::{ChannelError, ConnectionStatus, TaskChannel};

/// Type alias for the write half of a WebSocket connection.
type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Timeout for establishing the WebSocket connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a call's reply.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the pushed-event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State shared between the channel handle and its connection task.
struct Shared {
    url: String,
    reconnect: ReconnectConfig,
    credential: parking_lot::Mutex<Option<String>>,
    /// Write half of the live connection, `None` while offline.
    writer: Mutex<Option<WsSink>>,
    /// In-flight calls awaiting a correlated reply.
    pending: parking_lot::Mutex<HashMap<u64, oneshot::Sender<CallReply>>>,
    next_request_id: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<TaskEvent>,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::info!(from = %previous, to = %status, "connection status changed");
        }
    }

    fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Builds the connect URL, appending the credential as a `token`
    /// query parameter.
    fn connect_url(&self) -> Result<String, ChannelError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| ChannelError::Protocol(format!("invalid hub url: {e}")))?;
        if let Some(token) = self.credential.lock().clone() {
            url.query_pairs_mut().append_pair("token", &token);
        }
        Ok(url.to_string())
    }

    /// Opens a WebSocket connection, installs the write half, and
    /// returns the read half.
    async fn open(&self) -> Result<WsReader, ChannelError> {
        let url = self.connect_url()?;
        let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url))
            .await
            .map_err(|_| {
                tracing::warn!(url = %self.url, "hub connect timed out");
                ChannelError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = %self.url, error = %e, "hub connect failed");
                map_ws_connect_error(e)
            })?;

        let (sink, reader) = stream.split();
        *self.writer.lock().await = Some(sink);
        Ok(reader)
    }

    /// Fails every in-flight call by dropping its reply sender; waiting
    /// callers observe [`ChannelError::NotConnected`].
    fn fail_pending(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "failing in-flight calls");
        }
        pending.clear();
    }

    /// Reads frames until the connection closes or errors, resolving
    /// replies and publishing events. Malformed frames are logged and
    /// skipped.
    async fn read_until_closed(&self, reader: &mut WsReader) {
        while let Some(msg_result) = reader.next().await {
            match msg_result {
                Ok(Message::Binary(data)) => match codec::decode_server(&data) {
                    Ok(ServerFrame::Reply { request_id, reply }) => {
                        let sender = self.pending.lock().remove(&request_id);
                        if let Some(sender) = sender {
                            let _ = sender.send(reply);
                        } else {
                            tracing::debug!(request_id, "reply with no waiting call");
                        }
                    }
                    Ok(ServerFrame::Event(event)) => {
                        // No subscribers is fine.
                        let _ = self.events.send(event);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed hub frame, skipping");
                    }
                },
                Ok(Message::Close(_)) => {
                    tracing::info!("hub closed the connection");
                    break;
                }
                Ok(_) => {
                    // Ignore text, ping, pong frames.
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket read error");
                    break;
                }
            }
        }
    }
}

/// WebSocket channel implementing [`TaskChannel`] with automatic
/// reconnection.
///
/// Created via [`WsChannel::new`]; no connection exists until
/// [`TaskChannel::connect`] is called.
pub struct WsChannel {
    shared: Arc<Shared>,
    conn_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsChannel {
    /// Creates a channel for the given hub. Does not connect.
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                url: config.hub_url,
                reconnect: config.reconnect,
                credential: parking_lot::Mutex::new(None),
                writer: Mutex::new(None),
                pending: parking_lot::Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                status,
                events,
            }),
            conn_task: parking_lot::Mutex::new(None),
        }
    }

    /// The hub URL this channel targets.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Sends one call and awaits its correlated reply.
    ///
    /// Hub rejections come back as errors: `Unauthorized` maps to
    /// [`ChannelError::Unauthorized`], `Malformed` to
    /// [`ChannelError::Protocol`].
    async fn call(&self, call: HubCall) -> Result<CallReply, ChannelError> {
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(request_id, tx);

        let frame = ClientFrame { request_id, call };
        let bytes = match codec::encode_client(&frame) {
            Ok(b) => b,
            Err(e) => {
                self.shared.pending.lock().remove(&request_id);
                return Err(ChannelError::Protocol(e.to_string()));
            }
        };

        {
            let mut writer = self.shared.writer.lock().await;
            let Some(sink) = writer.as_mut() else {
                self.shared.pending.lock().remove(&request_id);
                return Err(ChannelError::NotConnected);
            };
            if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                self.shared.pending.lock().remove(&request_id);
                tracing::warn!(error = %e, "WebSocket send failed");
                return Err(ChannelError::NotConnected);
            }
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(CallReply::Error(CallError::Unauthorized))) => Err(ChannelError::Unauthorized),
            Ok(Ok(CallReply::Error(CallError::Malformed(reason)))) => {
                Err(ChannelError::Protocol(reason))
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ChannelError::NotConnected),
            Err(_) => {
                self.shared.pending.lock().remove(&request_id);
                Err(ChannelError::Timeout)
            }
        }
    }
}

impl TaskChannel for WsChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        self.disconnect().await;
        self.shared.set_status(ConnectionStatus::Connecting);

        let reader = match self.shared.open().await {
            Ok(r) => r,
            Err(e) => {
                self.shared.set_status(ConnectionStatus::Failed);
                return Err(e);
            }
        };
        self.shared.set_status(ConnectionStatus::Connected);

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(connection_loop(shared, reader));
        *self.conn_task.lock() = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) {
        self.shared.set_status(ConnectionStatus::Disconnected);
        let handle = self.conn_task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        if let Some(mut sink) = self.shared.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        self.shared.fail_pending();
    }

    fn set_credential(&self, token: Option<String>) {
        *self.shared.credential.lock() = token;
    }

    fn credential(&self) -> Option<String> {
        self.shared.credential.lock().clone()
    }

    async fn add_task(&self, task: Task) -> Result<Task, ChannelError> {
        match self.call(HubCall::AddTask(task)).await? {
            CallReply::TaskCreated(stored) => Ok(stored),
            other => Err(ChannelError::Protocol(format!(
                "unexpected reply to add_task: {other:?}"
            ))),
        }
    }

    async fn update_task(&self, task: Task) -> Result<bool, ChannelError> {
        match self.call(HubCall::UpdateTask(task)).await? {
            CallReply::Accepted(applied) => Ok(applied),
            other => Err(ChannelError::Protocol(format!(
                "unexpected reply to update_task: {other:?}"
            ))),
        }
    }

    async fn delete_task(&self, user_id: u64, task_id: TaskId) -> Result<bool, ChannelError> {
        match self.call(HubCall::DeleteTask { user_id, task_id }).await? {
            CallReply::Accepted(applied) => Ok(applied),
            other => Err(ChannelError::Protocol(format!(
                "unexpected reply to delete_task: {other:?}"
            ))),
        }
    }

    async fn lock_task(&self, user_id: u64, task_id: TaskId) -> Result<bool, ChannelError> {
        match self.call(HubCall::LockTask { user_id, task_id }).await? {
            CallReply::Accepted(acquired) => Ok(acquired),
            other => Err(ChannelError::Protocol(format!(
                "unexpected reply to lock_task: {other:?}"
            ))),
        }
    }

    async fn unlock_task(&self, user_id: u64, task_id: TaskId) -> Result<bool, ChannelError> {
        match self.call(HubCall::UnlockTask { user_id, task_id }).await? {
            CallReply::Accepted(released) => Ok(released),
            other => Err(ChannelError::Protocol(format!(
                "unexpected reply to unlock_task: {other:?}"
            ))),
        }
    }

    async fn list_tasks(&self, user_id: u64) -> Result<Vec<Task>, ChannelError> {
        match self.call(HubCall::ListTasks { user_id }).await? {
            CallReply::Tasks(tasks) => Ok(tasks),
            other => Err(ChannelError::Protocol(format!(
                "unexpected reply to list_tasks: {other:?}"
            ))),
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.shared.current_status()
    }

    fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }
}

/// Connection task: reads until the connection drops, then reconnects
/// with backoff until it succeeds or gives up.
async fn connection_loop(shared: Arc<Shared>, mut reader: WsReader) {
    loop {
        shared.read_until_closed(&mut reader).await;
        shared.fail_pending();
        *shared.writer.lock().await = None;

        // Voluntary disconnect; nothing to recover.
        if shared.current_status() == ConnectionStatus::Disconnected {
            break;
        }

        shared.set_status(ConnectionStatus::Reconnecting);
        match reconnect_with_backoff(&shared).await {
            Some(new_reader) => {
                shared.set_status(ConnectionStatus::Connected);
                reader = new_reader;
            }
            None => {
                if shared.current_status() != ConnectionStatus::Disconnected {
                    shared.set_status(ConnectionStatus::Failed);
                }
                break;
            }
        }
    }
    tracing::debug!("connection task exiting");
}

/// Retries the connection with exponentially increasing delays.
///
/// Returns `None` after the attempt budget is exhausted or when a
/// voluntary disconnect interrupts the retries.
async fn reconnect_with_backoff(shared: &Arc<Shared>) -> Option<WsReader> {
    let mut delay = shared.reconnect.initial_delay;
    for attempt in 1..=shared.reconnect.max_attempts {
        tokio::time::sleep(delay).await;
        if shared.current_status() == ConnectionStatus::Disconnected {
            return None;
        }
        match shared.open().await {
            Ok(reader) => {
                tracing::info!(attempt, "reconnected to hub");
                return Some(reader);
            }
            Err(e) => {
                tracing::warn!(
                    attempt,
                    max = shared.reconnect.max_attempts,
                    error = %e,
                    "reconnect attempt failed"
                );
                delay = (delay * 2).min(shared.reconnect.max_delay);
            }
        }
    }
    tracing::warn!("reconnect attempts exhausted");
    None
}

/// Map a `tokio_tungstenite` connection error to a [`ChannelError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> ChannelError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) if response.status() == 401 => ChannelError::Unauthorized,
        WsError::Io(io_err) => ChannelError::Io(io_err),
        other => ChannelError::Protocol(format!("hub connection error: {other}")),
    }
}
