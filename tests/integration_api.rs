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

use common::{TestApp, issue_token};
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

async fn create_conversation(app: &TestApp, caller: Uuid, buyer: Uuid, seller: Uuid) -> Value {
    let resp = app
        .client
        .post(app.url("/v1/conversations"))
        .bearer_auth(issue_token(caller))
        .json(&json!({ "buyerId": buyer, "sellerId": seller }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    resp.json().await.unwrap()
}

async fn send(app: &TestApp, caller: Uuid, conversation_id: &str, body: Value) -> reqwest::Response {
    app.client
        .post(app.url(&format!("/v1/conversations/{conversation_id}/messages")))
        .bearer_auth(issue_token(caller))
        .json(&body)
        .send()
        .await
        .unwrap()
}

/// Reads text frames until one matches `predicate`.
async fn next_frame<S>(stream: &mut S, predicate: impl Fn(&Value) -> bool) -> Option<Value>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let msg = tokio::time::timeout(remaining, stream.next()).await.ok()??.ok()?;
        if let Message::Text(text) = msg {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if predicate(&frame) {
                return Some(frame);
            }
        }
    }
}

#[tokio::test]
async fn test_requests_without_valid_token_are_rejected() {
    let app = TestApp::spawn().await;

    let resp = app.client.get(app.url("/v1/conversations")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app.client.get(app.url("/v1/conversations")).bearer_auth("not-a-jwt").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app.client.get(app.url("/v1/conversations")).bearer_auth(issue_token(Uuid::new_v4())).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_conversation_message_flow() {
    let app = TestApp::spawn().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let conversation = create_conversation(&app, alice, alice, bob).await;
    let again = create_conversation(&app, bob, alice, bob).await;
    assert_eq!(conversation["id"], again["id"]);
    let id = conversation["id"].as_str().unwrap().to_string();

    let resp = send(&app, alice, &id, json!({ "content": "Hi", "clientMessageId": Uuid::new_v4() })).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let first: Value = resp.json().await.unwrap();
    assert_eq!(first["messageType"], "text");
    assert_eq!(first["content"], "Hi");

    let resp = send(
        &app,
        alice,
        &id,
        json!({ "content": "Photo", "messageType": "image", "metadata": { "url": "https://cdn.example/a.jpg" } }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let second: Value = resp.json().await.unwrap();
    assert_eq!(second["metadata"]["url"], "https://cdn.example/a.jpg");

    // Bob sees two unread messages.
    let list: Value = app
        .client
        .get(app.url("/v1/conversations"))
        .bearer_auth(issue_token(bob))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list[0]["id"], conversation["id"]);
    assert_eq!(list[0]["unreadCount"], 2);

    // Paging newest first, oldest-first within a page.
    let page: Value = app
        .client
        .get(app.url(&format!("/v1/conversations/{id}/messages?limit=1")))
        .bearer_auth(issue_token(bob))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["messages"][0]["id"], second["id"]);
    assert_eq!(page["hasMore"], true);
    let cursor = page["nextCursor"].as_str().unwrap();

    let older: Value = app
        .client
        .get(app.url(&format!("/v1/conversations/{id}/messages?before={cursor}")))
        .bearer_auth(issue_token(bob))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(older["messages"].as_array().unwrap().len(), 1);
    assert_eq!(older["messages"][0]["id"], first["id"]);
    assert_eq!(older["hasMore"], false);

    let resp = app
        .client
        .get(app.url(&format!("/v1/conversations/{id}/messages?before=garbage")))
        .bearer_auth(issue_token(bob))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let receipt: Value = app
        .client
        .post(app.url(&format!("/v1/conversations/{id}/read")))
        .bearer_auth(issue_token(bob))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(receipt["unreadCount"], 0);
    assert_eq!(receipt["messageIds"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_validation_and_authorization_errors() {
    let app = TestApp::spawn().await;
    let (alice, bob, mallory) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let conversation = create_conversation(&app, alice, alice, bob).await;
    let id = conversation["id"].as_str().unwrap().to_string();

    let resp = send(&app, alice, &id, json!({ "content": "   " })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let resp = send(&app, alice, &id, json!({ "content": "x".repeat(4001) })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let resp = send(&app, alice, &id, json!({ "content": "pic", "messageType": "image", "metadata": {} })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = send(&app, mallory, &id, json!({ "content": "hello" })).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = app
        .client
        .get(app.url(&format!("/v1/conversations/{id}")))
        .bearer_auth(issue_token(mallory))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = app
        .client
        .get(app.url(&format!("/v1/conversations/{}", Uuid::new_v4())))
        .bearer_auth(issue_token(alice))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app
        .client
        .post(app.url("/v1/conversations"))
        .bearer_auth(issue_token(alice))
        .json(&json!({ "buyerId": alice, "sellerId": alice }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .client
        .patch(app.url(&format!("/v1/conversations/{id}")))
        .bearer_auth(issue_token(bob))
        .json(&json!({ "status": "bogus" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .client
        .patch(app.url(&format!("/v1/conversations/{id}")))
        .bearer_auth(issue_token(bob))
        .json(&json!({ "status": "blocked" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "blocked");

    let resp = send(&app, alice, &id, json!({ "content": "hello?" })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_edit_and_delete_messages() {
    let app = TestApp::spawn().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation = create_conversation(&app, alice, alice, bob).await;
    let id = conversation["id"].as_str().unwrap().to_string();
    let message: Value = send(&app, alice, &id, json!({ "content": "100 EUR" })).await.json().await.unwrap();
    let message_id = message["id"].as_str().unwrap().to_string();

    let resp = app
        .client
        .patch(app.url(&format!("/v1/messages/{message_id}")))
        .bearer_auth(issue_token(bob))
        .json(&json!({ "content": "free" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let edited: Value = app
        .client
        .patch(app.url(&format!("/v1/messages/{message_id}")))
        .bearer_auth(issue_token(alice))
        .json(&json!({ "content": "90 EUR" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(edited["content"], "90 EUR");
    assert!(!edited["editedAt"].is_null());

    let resp = app
        .client
        .delete(app.url(&format!("/v1/messages/{message_id}")))
        .bearer_auth(issue_token(alice))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let deleted: Value = resp.json().await.unwrap();
    assert!(!deleted["deletedAt"].is_null());

    let resp = app
        .client
        .delete(app.url(&format!("/v1/messages/{message_id}")))
        .bearer_auth(issue_token(alice))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_gateway_delivers_observed_conversation_events() {
    let app = TestApp::spawn().await;
    let (alice, bob, mallory) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let conversation = create_conversation(&app, alice, alice, bob).await;
    let id = conversation["id"].as_str().unwrap().to_string();

    let (ws, _) = tokio_tungstenite::connect_async(format!("{}?token={}", app.ws_url, issue_token(bob))).await.unwrap();
    let (mut sink, mut stream) = ws.split();

    sink.send(Message::text(json!({ "type": "observe", "conversationId": id }).to_string())).await.unwrap();
    let observing = next_frame(&mut stream, |f| f["type"] == "observing").await.expect("observe acknowledged");
    assert_eq!(observing["conversationId"], conversation["id"]);

    send(&app, alice, &id, json!({ "content": "Live hello" })).await;

    // The two frames come from different topics, so their order is not fixed.
    let (mut created, mut updated) = (None, None);
    while created.is_none() || updated.is_none() {
        let frame = next_frame(&mut stream, |f| f["type"] == "messageCreated" || f["type"] == "conversationUpdated")
            .await
            .expect("live frames pushed");
        if frame["type"] == "messageCreated" {
            created = Some(frame);
        } else if frame["conversation"]["id"] == conversation["id"] && frame["conversation"]["unreadCount"] == 1 {
            updated = Some(frame);
        }
    }
    let (created, updated) = (created.unwrap(), updated.unwrap());
    assert_eq!(created["message"]["content"], "Live hello");
    assert_eq!(updated["conversation"]["lastMessageId"], created["message"]["id"]);

    // Outsiders cannot observe.
    let (ws, _) =
        tokio_tungstenite::connect_async(format!("{}?token={}", app.ws_url, issue_token(mallory))).await.unwrap();
    let (mut sink, mut stream) = ws.split();
    sink.send(Message::text(json!({ "type": "observe", "conversationId": id }).to_string())).await.unwrap();
    let error = next_frame(&mut stream, |f| f["type"] == "error").await.expect("observe refused");
    assert_eq!(error["message"], "Access denied");
}

#[tokio::test]
async fn test_gateway_rejects_invalid_token() {
    let app = TestApp::spawn().await;
    let result = tokio_tungstenite::connect_async(format!("{}?token=invalid", app.ws_url)).await;
    assert!(result.is_err());
}
