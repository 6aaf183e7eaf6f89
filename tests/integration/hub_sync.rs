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

//! End-to-end synchronization tests: mutations made on one connection
//! are pushed to every other connection of the same user, carry the
//! originating connection's id, and never leak to other users' groups.

use std::sync::Arc;
use std::time::Duration;

use tasksync_client::channel::ws::WsChannel;
use tasksync_client::channel::{ConnectionStatus, TaskChannel};
use tasksync_client::config::{ChannelConfig, ReconnectConfig};
use tasksync_hub::auth::TokenRegistry;
use tasksync_proto::task::Task;
use tasksync_proto::wire::TaskEvent;
use tokio::sync::broadcast;

async fn start_hub() -> (String, Arc<TokenRegistry>) {
    let registry = Arc::new(TokenRegistry::new());
    let (addr, _handle) = tasksync_hub::hub::start_server("127.0.0.1:0", registry.clone())
        .await
        .expect("failed to start hub");
    (format!("ws://{addr}/ws"), registry)
}

async fn connect_channel(url: &str, token: &str) -> WsChannel {
    let channel = WsChannel::new(ChannelConfig {
        hub_url: url.to_string(),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 3,
        },
    });
    channel.set_credential(Some(token.to_string()));
    channel.connect().await.expect("connect failed");
    assert_eq!(channel.status(), ConnectionStatus::Connected);
    channel
}

async fn next_event(events: &mut broadcast::Receiver<TaskEvent>) -> TaskEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

#[tokio::test]
async fn mutation_reaches_all_sibling_connections() {
    let (url, registry) = start_hub().await;
    let a = connect_channel(&url, &registry.issue(1)).await;
    let b = connect_channel(&url, &registry.issue(1)).await;
    let c = connect_channel(&url, &registry.issue(1)).await;

    let mut events_b = b.subscribe_events();
    let mut events_c = c.subscribe_events();

    let task = a.add_task(Task::new(1, "groceries")).await.unwrap();

    for events in [&mut events_b, &mut events_c] {
        match next_event(events).await {
            TaskEvent::Added { task: pushed, .. } => assert_eq!(pushed.id, task.id),
            other => panic!("expected Added, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn originator_also_receives_its_own_event() {
    let (url, registry) = start_hub().await;
    let a = connect_channel(&url, &registry.issue(1)).await;

    let mut events = a.subscribe_events();
    let task = a.add_task(Task::new(1, "echo")).await.unwrap();

    match next_event(&mut events).await {
        TaskEvent::Added { task: pushed, .. } => assert_eq!(pushed.id, task.id),
        other => panic!("expected Added, got {other:?}"),
    }
}

#[tokio::test]
async fn events_carry_consistent_sender_id() {
    let (url, registry) = start_hub().await;
    let a = connect_channel(&url, &registry.issue(1)).await;
    let b = connect_channel(&url, &registry.issue(1)).await;

    let mut events_a = a.subscribe_events();
    let mut events_b = b.subscribe_events();

    // One mutation from each connection.
    let task_a = a.add_task(Task::new(1, "from a")).await.unwrap();
    let task_b = b.add_task(Task::new(1, "from b")).await.unwrap();

    // Both receivers see both events with identical sender ids per event.
    let mut a_senders = Vec::new();
    let mut b_senders = Vec::new();
    for _ in 0..2 {
        let event = next_event(&mut events_a).await;
        a_senders.push((event.task_id(), event.sender()));
        let event = next_event(&mut events_b).await;
        b_senders.push((event.task_id(), event.sender()));
    }
    a_senders.sort_by_key(|(id, _)| *id.as_uuid());
    b_senders.sort_by_key(|(id, _)| *id.as_uuid());
    assert_eq!(a_senders, b_senders, "sender id must be the same for every receiver");

    // The two mutations came from different connections.
    let sender_of = |task_id, senders: &[(_, _)]| {
        senders
            .iter()
            .find(|(id, _)| *id == task_id)
            .map(|(_, s)| *s)
            .unwrap()
    };
    assert_ne!(
        sender_of(task_a.id, &a_senders),
        sender_of(task_b.id, &a_senders),
        "different connections must have different sender ids"
    );
}

#[tokio::test]
async fn full_lifecycle_events_in_order() {
    let (url, registry) = start_hub().await;
    let a = connect_channel(&url, &registry.issue(1)).await;
    let b = connect_channel(&url, &registry.issue(1)).await;

    let mut events = b.subscribe_events();

    let task = a.add_task(Task::new(1, "lifecycle")).await.unwrap();
    let mut edited = task.clone();
    edited.title = "lifecycle, edited".to_string();
    assert!(a.update_task(edited).await.unwrap());
    assert!(a.lock_task(1, task.id).await.unwrap());
    assert!(a.unlock_task(1, task.id).await.unwrap());
    assert!(a.delete_task(1, task.id).await.unwrap());

    let mut names = Vec::new();
    for _ in 0..5 {
        names.push(match next_event(&mut events).await {
            TaskEvent::Added { .. } => "added",
            TaskEvent::Updated { .. } => "updated",
            TaskEvent::Locked { .. } => "locked",
            TaskEvent::Unlocked { .. } => "unlocked",
            TaskEvent::Deleted { .. } => "deleted",
        });
    }
    assert_eq!(names, vec!["added", "updated", "locked", "unlocked", "deleted"]);
}

#[tokio::test]
async fn events_stay_within_the_users_group() {
    let (url, registry) = start_hub().await;
    let a = connect_channel(&url, &registry.issue(1)).await;
    let outsider = connect_channel(&url, &registry.issue(2)).await;

    let mut outsider_events = outsider.subscribe_events();

    a.add_task(Task::new(1, "private")).await.unwrap();

    // The outsider sees nothing within a grace window.
    let result =
        tokio::time::timeout(Duration::from_millis(500), outsider_events.recv()).await;
    assert!(result.is_err(), "event leaked across user groups: {result:?}");

    // And the outsider's task list is untouched.
    assert!(outsider.list_tasks(2).await.unwrap().is_empty());
}

#[tokio::test]
async fn update_from_sibling_preserves_lock_flag() {
    let (url, registry) = start_hub().await;
    let a = connect_channel(&url, &registry.issue(1)).await;
    let b = connect_channel(&url, &registry.issue(1)).await;

    let task = a.add_task(Task::new(1, "locked work")).await.unwrap();
    assert!(a.lock_task(1, task.id).await.unwrap());

    // A sibling's update cannot clear the lock flag.
    let mut edited = task.clone();
    edited.title = "sibling edit".to_string();
    edited.is_locked = false;
    assert!(b.update_task(edited).await.unwrap());

    let tasks = b.list_tasks(1).await.unwrap();
    assert_eq!(tasks[0].title, "sibling edit");
    assert!(tasks[0].is_locked, "update must not clear the hub's lock flag");
}
