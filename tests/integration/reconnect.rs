// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Reconnection tests: the channel detects a severed connection, walks
//! its exponential backoff, resumes service when the hub is reachable
//! again, and reports `Failed` once its attempts are exhausted.
//!
//! ## Disconnect simulation
//!
//! Aborting the hub server's `JoinHandle` does not close established
//! WebSocket connections (they live on independently-spawned tasks).
//! Instead a **TCP proxy** sits between the client and the real hub; to
//! simulate a disconnect we abort ALL proxy connection tasks (tracked
//! in a shared vec), which immediately closes both ends of every
//! proxied TCP connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tasksync_client::channel::ws::WsChannel;
use tasksync_client::channel::{ConnectionStatus, TaskChannel};
use tasksync_client::config::{ChannelConfig, ReconnectConfig};
use tasksync_client::queue::MemoryQueue;
use tasksync_client::resilient::ResilientClient;
use tasksync_hub::auth::TokenRegistry;
use tasksync_proto::task::Task;

// =============================================================================
// TCP Proxy helper
// =============================================================================

/// A simple TCP proxy that forwards traffic between a client-facing port
/// and a backend (the real hub). Calling `kill()` aborts all tracked
/// connection tasks, tearing down both directions of every proxied TCP
/// connection so the client's WebSocket layer detects a disconnect.
struct TcpProxy {
    /// Address clients should connect to (127.0.0.1:<proxy_port>).
    pub client_addr: String,
    /// The acceptor task handle.
    accept_handle: tokio::task::JoinHandle<()>,
    /// All per-connection task handles. Aborting these kills the TCP streams.
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    /// Create a new TCP proxy from `proxy_port` to `backend_addr`.
    async fn new(proxy_port: u16, backend_addr: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {proxy_port}: {e}"));
        let bound_addr = listener.local_addr().unwrap();
        let client_addr = format!("127.0.0.1:{}", bound_addr.port());
        let backend = backend_addr.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let conn_handles_clone = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            loop {
                let (mut client_stream, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => break,
                };

                let backend = backend.clone();
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };

                    // Copy bidirectionally. When this task is aborted,
                    // both streams are dropped immediately, causing RST
                    // on both ends. No sub-tasks, so abort propagates.
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });

                conn_handles_clone.lock().push(conn_handle);
            }
        });

        Self {
            client_addr,
            accept_handle,
            conn_handles,
        }
    }

    /// Kill the proxy, severing all connections immediately.
    fn kill(self) {
        self.accept_handle.abort();
        let handles = self.conn_handles.lock();
        for h in handles.iter() {
            h.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Find a free port by binding to 0 and recording the port.
async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind to port 0");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    // Brief pause to let the OS release the port.
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

/// Start the hub on an OS-assigned port, return its bound address.
async fn start_hub() -> (String, Arc<TokenRegistry>) {
    let registry = Arc::new(TokenRegistry::new());
    let (addr, _handle) = tasksync_hub::hub::start_server("127.0.0.1:0", registry.clone())
        .await
        .expect("failed to start hub");
    (addr.to_string(), registry)
}

fn make_channel(url: &str, token: &str) -> Arc<WsChannel> {
    let channel = WsChannel::new(ChannelConfig {
        hub_url: url.to_string(),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        },
    });
    channel.set_credential(Some(token.to_string()));
    Arc::new(channel)
}

/// Wait for the channel's status watch to report `wanted`, with timeout.
async fn wait_for_status(channel: &WsChannel, wanted: ConnectionStatus) {
    let mut status_rx = channel.watch_status();
    tokio::time::timeout(
        Duration::from_secs(10),
        status_rx.wait_for(|s| *s == wanted),
    )
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for status {wanted}"))
    .expect("status watch closed");
}

// =============================================================================
// Tests
// =============================================================================

/// After the connection is severed and the proxy comes back on the same
/// port, the channel reconnects automatically and calls work again.
#[tokio::test]
async fn reconnects_after_connection_severed() {
    let (hub_addr, registry) = start_hub().await;

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &hub_addr).await;
    let proxy_url = format!("ws://{}/ws", proxy.client_addr);

    let channel = make_channel(&proxy_url, &registry.issue(1));
    channel.connect().await.expect("initial connect failed");
    let task = channel.add_task(Task::new(1, "before the cut")).await.unwrap();

    proxy.kill();
    wait_for_status(&channel, ConnectionStatus::Reconnecting).await;

    // Bring the proxy back on the same port; the hub itself never died.
    let _proxy2 = TcpProxy::new(proxy_port, &hub_addr).await;
    wait_for_status(&channel, ConnectionStatus::Connected).await;

    // The hub still has the pre-cut state and calls flow again.
    let tasks = channel.list_tasks(1).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, task.id);
}

/// With no backend to reach, the backoff schedule runs to exhaustion and
/// the channel lands in `Failed`.
#[tokio::test]
async fn exhausted_attempts_end_in_failed() {
    let (hub_addr, registry) = start_hub().await;

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &hub_addr).await;
    let proxy_url = format!("ws://{}/ws", proxy.client_addr);

    let channel = WsChannel::new(ChannelConfig {
        hub_url: proxy_url,
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_attempts: 3,
        },
    });
    channel.set_credential(Some(registry.issue(1)));
    channel.connect().await.expect("initial connect failed");

    // Kill the proxy and never bring it back.
    proxy.kill();
    let cut_at = Instant::now();

    wait_for_status(&channel, ConnectionStatus::Reconnecting).await;
    wait_for_status(&channel, ConnectionStatus::Failed).await;

    // Three exponential attempts at 100/200/400ms put a floor on the
    // time spent before giving up.
    assert!(
        cut_at.elapsed() >= Duration::from_millis(600),
        "backoff gave up too quickly: {:?}",
        cut_at.elapsed()
    );

    // A call in the failed state is a transport error, not a hang.
    let result = channel.list_tasks(1).await;
    assert!(result.is_err());
}

/// A voluntary disconnect is final: no reconnection attempts follow.
#[tokio::test]
async fn voluntary_disconnect_suppresses_reconnect() {
    let (hub_addr, registry) = start_hub().await;
    let channel = make_channel(&format!("ws://{hub_addr}/ws"), &registry.issue(1));
    channel.connect().await.expect("connect failed");

    channel.disconnect().await;
    assert_eq!(channel.status(), ConnectionStatus::Disconnected);

    // Give any stray reconnect logic time to fire, then confirm the
    // status never left Disconnected.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(channel.status(), ConnectionStatus::Disconnected);
}

/// Mutations made while the channel is reconnecting are queued by the
/// resilient wrapper and replayed once the connection returns.
#[tokio::test]
async fn mutations_during_outage_replay_after_reconnect() {
    let (hub_addr, registry) = start_hub().await;

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &hub_addr).await;
    let proxy_url = format!("ws://{}/ws", proxy.client_addr);

    let channel = make_channel(&proxy_url, &registry.issue(1));
    let client = ResilientClient::new(Arc::clone(&channel), Arc::new(MemoryQueue::new()), 1);

    client.connect().await.expect("initial connect failed");

    proxy.kill();
    wait_for_status(&channel, ConnectionStatus::Reconnecting).await;

    // Written during the outage: acknowledged optimistically, queued.
    let task = client.add_task(Task::new(1, "written mid-outage")).await.unwrap();
    assert_eq!(client.pending_count(), 1);
    assert!(client.list_tasks(1).await.unwrap().is_empty());

    let _proxy2 = TcpProxy::new(proxy_port, &hub_addr).await;
    wait_for_status(&channel, ConnectionStatus::Connected).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.pending_count() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue was not drained after reconnect"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let tasks = client.list_tasks(1).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, task.id);
}
