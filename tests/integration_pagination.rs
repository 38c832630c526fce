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

use common::TestEnv;
use marketdz_messaging::services::message_cache::CacheState;
use std::collections::HashSet;
use uuid::Uuid;

async fn seed_history(env: &TestEnv, count: usize) -> (Uuid, Uuid, Vec<Uuid>) {
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation = env.conversation(alice, bob).await;
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let sender = if i % 2 == 0 { alice } else { bob };
        ids.push(env.seed(conversation.id, sender, &format!("message {i}")).await.id);
    }
    (conversation.id, bob, ids)
}

#[tokio::test]
async fn test_initial_window_then_older_page() {
    let env = TestEnv::new();
    let (conversation_id, bob, ids) = seed_history(&env, 25).await;
    let session = env.sign_in(bob).await;
    let open = session.open(conversation_id).await.unwrap();

    open.load_initial(Some(20)).await.unwrap();
    let window = open.window();
    assert_eq!(window.state, CacheState::Ready);
    assert!(window.has_more);
    assert_eq!(window.message_ids(), ids[5..].to_vec(), "the 20 newest, oldest first");

    let older = open.load_older().await.unwrap();
    assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), ids[..5].to_vec());

    let window = open.window();
    assert!(!window.has_more);
    assert_eq!(window.message_ids(), ids);

    // Exhausted history is a no-op, not an error.
    assert!(open.load_older().await.unwrap().is_empty());
    assert_eq!(open.window().message_ids().len(), 25);
}

#[tokio::test]
async fn test_load_older_never_duplicates() {
    let env = TestEnv::new();
    let (conversation_id, bob, ids) = seed_history(&env, 23).await;
    let session = env.sign_in(bob).await;
    let open = session.open(conversation_id).await.unwrap();

    open.load_initial(Some(5)).await.unwrap();
    while open.window().has_more {
        open.load_older().await.unwrap();
    }

    let window = open.window().message_ids();
    let unique: HashSet<_> = window.iter().collect();
    assert_eq!(unique.len(), window.len());
    assert_eq!(window, ids);
}

#[tokio::test]
async fn test_cursor_paging_through_session() {
    let env = TestEnv::new();
    let (conversation_id, bob, ids) = seed_history(&env, 25).await;
    let session = env.sign_in(bob).await;

    let first = session.load_messages(conversation_id, None).await.unwrap();
    assert_eq!(first.messages.len(), 20);
    assert!(first.has_more);
    assert_eq!(first.next_cursor, Some(first.messages[0].cursor()));

    let second = session.load_messages(conversation_id, first.next_cursor).await.unwrap();
    assert_eq!(second.messages.len(), 5);
    assert!(!second.has_more);

    let all: Vec<Uuid> = second.messages.iter().chain(first.messages.iter()).map(|m| m.id).collect();
    assert_eq!(all, ids);
    for pair in all.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
}

#[tokio::test]
async fn test_deleted_messages_are_skipped() {
    let env = TestEnv::new();
    let (conversation_id, bob, ids) = seed_history(&env, 4).await;
    use marketdz_messaging::services::store::MessageStore;
    env.store.soft_delete_message(ids[1]).await.unwrap();

    let session = env.sign_in(bob).await;
    let open = session.open(conversation_id).await.unwrap();
    open.load_initial(None).await.unwrap();

    assert_eq!(open.window().message_ids(), vec![ids[0], ids[2], ids[3]]);
    assert!(!open.window().has_more);
}
