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

//! Store-and-forward tests over a real hub: mutations made before the
//! channel ever connects are queued, acknowledged optimistically, and
//! replayed FIFO once the connection comes up.

use std::sync::Arc;
use std::time::Duration;

use tasksync_client::channel::ws::WsChannel;
use tasksync_client::channel::TaskChannel;
use tasksync_client::config::{ChannelConfig, ReconnectConfig};
use tasksync_client::queue::MemoryQueue;
use tasksync_client::resilient::ResilientClient;
use tasksync_hub::auth::TokenRegistry;
use tasksync_proto::task::Task;
use tasksync_proto::wire::TaskEvent;

async fn start_hub() -> (String, Arc<TokenRegistry>) {
    let registry = Arc::new(TokenRegistry::new());
    let (addr, _handle) = tasksync_hub::hub::start_server("127.0.0.1:0", registry.clone())
        .await
        .expect("failed to start hub");
    (format!("ws://{addr}/ws"), registry)
}

fn make_channel(url: &str, token: &str) -> Arc<WsChannel> {
    let channel = WsChannel::new(ChannelConfig {
        hub_url: url.to_string(),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 3,
        },
    });
    channel.set_credential(Some(token.to_string()));
    Arc::new(channel)
}

async fn wait_until_drained(client: &ResilientClient<WsChannel, MemoryQueue>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.pending_count() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue was not drained in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn queued_mutations_replay_after_first_connect() {
    let (url, registry) = start_hub().await;
    let channel = make_channel(&url, &registry.issue(1));
    let client = ResilientClient::new(Arc::clone(&channel), Arc::new(MemoryQueue::new()), 1);

    // Never connected: mutations queue up with optimistic acks.
    let task = client.add_task(Task::new(1, "written offline")).await.unwrap();
    let mut edited = task.clone();
    edited.title = "edited offline".to_string();
    assert!(client.update_task(edited).await.unwrap());
    assert_eq!(client.pending_count(), 2);

    // Offline reads are empty, not errors.
    assert!(client.list_tasks(1).await.unwrap().is_empty());

    client.connect().await.unwrap();
    wait_until_drained(&client).await;

    let tasks = client.list_tasks(1).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, task.id);
    assert_eq!(tasks[0].title, "edited offline");
}

#[tokio::test]
async fn replay_preserves_submission_order() {
    let (url, registry) = start_hub().await;
    let channel = make_channel(&url, &registry.issue(1));
    let client = ResilientClient::new(Arc::clone(&channel), Arc::new(MemoryQueue::new()), 1);

    // add -> update -> delete for one task, plus a second add that must
    // survive. Replayed out of order the delete would miss.
    let doomed = client.add_task(Task::new(1, "doomed")).await.unwrap();
    let mut edited = doomed.clone();
    edited.title = "doomed, edited".to_string();
    client.update_task(edited).await.unwrap();
    client.delete_task(1, doomed.id).await.unwrap();
    let survivor = client.add_task(Task::new(1, "survivor")).await.unwrap();
    assert_eq!(client.pending_count(), 4);

    client.connect().await.unwrap();
    wait_until_drained(&client).await;

    let tasks = client.list_tasks(1).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, survivor.id);
    assert_eq!(tasks[0].title, "survivor");
}

#[tokio::test]
async fn siblings_receive_replayed_mutations_as_events() {
    let (url, registry) = start_hub().await;

    let sibling = make_channel(&url, &registry.issue(1));
    sibling.connect().await.unwrap();
    let mut events = sibling.subscribe_events();

    let channel = make_channel(&url, &registry.issue(1));
    let client = ResilientClient::new(Arc::clone(&channel), Arc::new(MemoryQueue::new()), 1);

    let task = client.add_task(Task::new(1, "deferred")).await.unwrap();
    client.connect().await.unwrap();
    wait_until_drained(&client).await;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for replayed event")
        .expect("event stream closed");
    match event {
        TaskEvent::Added { task: pushed, .. } => assert_eq!(pushed.id, task.id),
        other => panic!("expected Added, got {other:?}"),
    }
}

#[tokio::test]
async fn hub_rejected_replay_is_discarded_not_retried() {
    let (url, registry) = start_hub().await;
    let channel = make_channel(&url, &registry.issue(1));
    let client = ResilientClient::new(Arc::clone(&channel), Arc::new(MemoryQueue::new()), 1);

    // An empty title passes the optimistic offline path but the hub
    // rejects it on replay.
    let mut bad = Task::new(1, "placeholder");
    bad.title = String::new();
    client.add_task(bad).await.unwrap();
    let good = client.add_task(Task::new(1, "valid")).await.unwrap();
    assert_eq!(client.pending_count(), 2);

    client.connect().await.unwrap();
    wait_until_drained(&client).await;

    // The rejected action is gone and the rest of the queue replayed.
    let tasks = client.list_tasks(1).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, good.id);
}

#[tokio::test]
async fn online_mutations_bypass_the_queue() {
    let (url, registry) = start_hub().await;
    let channel = make_channel(&url, &registry.issue(1));
    let client = ResilientClient::new(Arc::clone(&channel), Arc::new(MemoryQueue::new()), 1);

    client.connect().await.unwrap();
    let task = client.add_task(Task::new(1, "direct")).await.unwrap();
    assert_eq!(client.pending_count(), 0);

    assert!(client.set_completion(task.clone(), true).await.unwrap());
    assert_eq!(client.pending_count(), 0);

    let tasks = client.list_tasks(1).await.unwrap();
    assert!(tasks[0].is_completed);
}
