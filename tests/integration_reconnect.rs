#![allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    missing_debug_implementations,
    clippy::clone_on_ref_ptr,
    clippy::items_after_statements,
    unreachable_pub,
    clippy::similar_names
)]
mod common;

use common::{TestEnv, wait_until};
use marketdz_messaging::domain::event::Topic;
use marketdz_messaging::services::store::MessageStore;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn test_reconnect_resyncs_window_and_list() {
    let env = TestEnv::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation = env.conversation(alice, bob).await;
    env.seed(conversation.id, alice, "before").await;

    let session = env.sign_in(bob).await;
    let open = session.open(conversation.id).await.unwrap();
    open.load_initial(None).await.unwrap();
    assert_eq!(open.window().messages.len(), 1);

    env.feed.disconnect();
    let missed_a = env.seed(conversation.id, alice, "missed one").await;
    let missed_b = env.seed(conversation.id, alice, "missed two").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(open.window().messages.len(), 1, "events are lost while disconnected");

    env.feed.reconnect();

    let snapshots = open.subscribe();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let ids = snapshots.borrow().message_ids();
            ids.contains(&missed_a.id) && ids.contains(&missed_b.id)
        })
        .await,
        "window should reload after the feed reconnects"
    );

    let list = session.conversations();
    assert!(
        wait_until(Duration::from_secs(2), || {
            list.borrow().iter().find(|c| c.id == conversation.id).is_some_and(|c| c.unread_for(bob) == 3)
        })
        .await,
        "list should refresh its counters after the feed reconnects"
    );
}

#[tokio::test]
async fn test_reconnect_drops_message_deleted_while_disconnected() {
    let env = TestEnv::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation = env.conversation(alice, bob).await;
    let first = env.seed(conversation.id, alice, "one").await;
    let second = env.seed(conversation.id, alice, "two").await;
    let newest = env.seed(conversation.id, alice, "three").await;

    let session = env.sign_in(bob).await;
    let open = session.open(conversation.id).await.unwrap();
    open.load_initial(None).await.unwrap();
    assert_eq!(open.window().message_ids(), vec![first.id, second.id, newest.id]);

    env.feed.disconnect();
    env.store.soft_delete_message(newest.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(open.window().messages.len(), 3, "the deletion event is lost while disconnected");

    env.feed.reconnect();

    let snapshots = open.subscribe();
    assert!(
        wait_until(Duration::from_secs(2), || snapshots.borrow().message_ids() == vec![first.id, second.id]).await,
        "window should drop the deleted message after the feed reconnects"
    );
}

#[tokio::test]
async fn test_closed_subscription_is_reestablished() {
    let env = TestEnv::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation = env.conversation(alice, bob).await;
    let topic = Topic::Conversation(conversation.id);

    let session = env.sign_in(bob).await;
    let open = session.open(conversation.id).await.unwrap();
    open.load_initial(None).await.unwrap();
    assert_eq!(env.feed.subscriber_count(topic), 1);

    env.feed.close_topic(topic);
    assert!(wait_until(Duration::from_secs(2), || env.feed.subscriber_count(topic) == 1).await);

    let message = env.seed(conversation.id, alice, "after resubscribe").await;
    let snapshots = open.subscribe();
    assert!(wait_until(Duration::from_secs(2), || snapshots.borrow().message_ids().contains(&message.id)).await);
}

#[tokio::test]
async fn test_observers_share_one_subscription() {
    let env = TestEnv::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation = env.conversation(alice, bob).await;
    let topic = Topic::Conversation(conversation.id);

    let session = env.sign_in(bob).await;
    let first = session.open(conversation.id).await.unwrap();
    let second = session.open(conversation.id).await.unwrap();
    assert_eq!(env.feed.subscriber_count(topic), 1);

    first.load_initial(None).await.unwrap();
    let message = env.seed(conversation.id, alice, "seen by both views").await;
    let snapshots = second.subscribe();
    assert!(wait_until(Duration::from_secs(2), || snapshots.borrow().message_ids().contains(&message.id)).await);

    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(env.feed.subscriber_count(topic), 1, "one observer remains");

    drop(second);
    assert!(
        wait_until(Duration::from_secs(2), || env.feed.subscriber_count(topic) == 0).await,
        "last observer leaving tears the subscription down"
    );

    let reopened = session.open(conversation.id).await.unwrap();
    assert_eq!(env.feed.subscriber_count(topic), 1);
    reopened.load_initial(None).await.unwrap();
    assert_eq!(reopened.window().messages.len(), 1);
}

#[tokio::test]
async fn test_sign_out_releases_every_subscription() {
    let env = TestEnv::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation = env.conversation(alice, bob).await;

    let session = env.sign_in(bob).await;
    let open = session.open(conversation.id).await.unwrap();
    assert_eq!(env.feed.subscriber_count(Topic::User(bob)), 1);

    session.sign_out();
    assert!(
        wait_until(Duration::from_secs(2), || {
            env.feed.subscriber_count(Topic::User(bob)) == 0
                && env.feed.subscriber_count(Topic::Conversation(conversation.id)) == 0
        })
        .await
    );
    drop(open);
}
