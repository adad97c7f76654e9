use serde_json::{json, Value};
use std::sync::Arc;
use warble_server::api;
use warble_server::config::{Config, RelayConfig};
use warble_server::state::AppState;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "test-secret";

async fn spawn_app(relay: RelayConfig) -> String {
    let mut config = Config::default();
    config.storage.backend = "memory".to_string();
    config.relay = relay;
    let state = Arc::new(AppState::new(config).expect("build app state"));
    let app = api::build_router(state.clone()).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("resolve local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn relay_config(endpoint: &str) -> RelayConfig {
    RelayConfig {
        endpoint: Some(endpoint.to_string()),
        secret: Some(SECRET.to_string()),
        ..RelayConfig::default()
    }
}

async fn create_thread(client: &reqwest::Client, base: &str, user: &str, title: &str) -> String {
    let response = client
        .post(format!("{base}/api/threads"))
        .json(&json!({ "anonUserId": user, "title": title }))
        .send()
        .await
        .expect("create thread request");
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("create thread body");
    assert_eq!(body["ok"], json!(true));
    body["threadId"]
        .as_str()
        .expect("threadId in response")
        .to_string()
}

async fn fetch_history(
    client: &reqwest::Client,
    base: &str,
    user: &str,
    thread_id: &str,
) -> Vec<Value> {
    let body: Value = client
        .get(format!("{base}/api/history"))
        .query(&[("anonUserId", user), ("threadId", thread_id)])
        .send()
        .await
        .expect("history request")
        .json()
        .await
        .expect("history body");
    assert_eq!(body["ok"], json!(true));
    body["messages"]
        .as_array()
        .expect("messages array")
        .clone()
}

#[tokio::test]
async fn create_list_rename_chat_history_flow() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bot"))
        .and(header("x-relay-secret", SECRET))
        .and(body_partial_json(json!({ "anonUserId": "u1", "text": "hello" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "reply": "hi there" })),
        )
        .mount(&mock)
        .await;
    let base = spawn_app(relay_config(&format!("{}/bot", mock.uri()))).await;
    let client = reqwest::Client::new();

    // Empty title falls back to the placeholder.
    let thread_id = create_thread(&client, &base, "u1", "").await;

    let body: Value = client
        .get(format!("{base}/api/threads"))
        .query(&[("anonUserId", "u1")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let threads = body["threads"].as_array().unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0]["id"], json!(thread_id));
    assert_eq!(threads[0]["title"], json!("New chat"));

    // Rename trims surrounding whitespace.
    let response = client
        .patch(format!("{base}/api/threads/{thread_id}"))
        .json(&json!({ "anonUserId": "u1", "title": "  Trip planning  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = client
        .get(format!("{base}/api/threads"))
        .query(&[("anonUserId", "u1")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["threads"][0]["title"], json!("Trip planning"));

    let response = client
        .post(format!("{base}/api/chat"))
        .json(&json!({ "anonUserId": "u1", "threadId": thread_id, "text": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["reply"], json!("hi there"));

    let messages = fetch_history(&client, &base, "u1", &thread_id).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], json!("user"));
    assert_eq!(messages[0]["content"], json!("hello"));
    assert_eq!(messages[1]["role"], json!("assistant"));
    assert_eq!(messages[1]["content"], json!("hi there"));
}

#[tokio::test]
async fn chat_without_relay_config_persists_nothing() {
    let base = spawn_app(RelayConfig::default()).await;
    let client = reqwest::Client::new();
    let thread_id = create_thread(&client, &base, "u2", "pending").await;

    let response = client
        .post(format!("{base}/api/chat"))
        .json(&json!({ "anonUserId": "u2", "threadId": thread_id, "text": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], json!(false));
    assert!(body["error"]
        .as_str()
        .unwrap_or_default()
        .contains("not configured"));

    let messages = fetch_history(&client, &base, "u2", &thread_id).await;
    assert!(messages.is_empty());
}

#[tokio::test]
async fn relay_failure_keeps_user_message_without_reply() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bot"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "ok": false, "error": "quota exceeded" })),
        )
        .mount(&mock)
        .await;
    let base = spawn_app(relay_config(&format!("{}/bot", mock.uri()))).await;
    let client = reqwest::Client::new();
    let thread_id = create_thread(&client, &base, "u3", "flaky").await;

    let response = client
        .post(format!("{base}/api/chat"))
        .json(&json!({ "anonUserId": "u3", "threadId": thread_id, "text": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap_or_default()
        .contains("quota exceeded"));

    // The user's message stays; no assistant message is written.
    let messages = fetch_history(&client, &base, "u3", &thread_id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], json!("user"));
}

#[tokio::test]
async fn missing_reply_is_persisted_verbatim() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bot"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&mock)
        .await;
    let base = spawn_app(relay_config(&format!("{}/bot", mock.uri()))).await;
    let client = reqwest::Client::new();
    let thread_id = create_thread(&client, &base, "u4", "quiet bot").await;

    let response = client
        .post(format!("{base}/api/chat"))
        .json(&json!({ "anonUserId": "u4", "threadId": thread_id, "text": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["reply"], Value::Null);

    let messages = fetch_history(&client, &base, "u4", &thread_id).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["role"], json!("assistant"));
    assert_eq!(messages[1]["content"], Value::Null);
}

#[tokio::test]
async fn foreign_user_sees_not_found_everywhere() {
    let mock = MockServer::start().await;
    let base = spawn_app(relay_config(&format!("{}/bot", mock.uri()))).await;
    let client = reqwest::Client::new();
    let thread_id = create_thread(&client, &base, "owner", "private").await;

    let response = client
        .get(format!("{base}/api/history"))
        .query(&[("anonUserId", "intruder"), ("threadId", thread_id.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .patch(format!("{base}/api/threads/{thread_id}"))
        .json(&json!({ "anonUserId": "intruder", "title": "mine now" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .post(format!("{base}/api/chat"))
        .json(&json!({ "anonUserId": "intruder", "threadId": thread_id, "text": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // A thread that does not exist at all answers identically.
    let response = client
        .get(format!("{base}/api/history"))
        .query(&[("anonUserId", "owner"), ("threadId", "th_missing")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn validation_failures_return_bad_request() {
    let base = spawn_app(RelayConfig::default()).await;
    let client = reqwest::Client::new();
    let thread_id = create_thread(&client, &base, "u5", "valid").await;

    let response = client
        .get(format!("{base}/api/threads"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .post(format!("{base}/api/threads"))
        .json(&json!({ "title": "no user" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .patch(format!("{base}/api/threads/{thread_id}"))
        .json(&json!({ "anonUserId": "u5", "title": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], json!(false));

    // A rejected rename leaves the stored title untouched.
    let body: Value = client
        .get(format!("{base}/api/threads"))
        .query(&[("anonUserId", "u5")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["threads"][0]["title"], json!("valid"));

    let response = client
        .post(format!("{base}/api/chat"))
        .json(&json!({ "anonUserId": "u5", "threadId": thread_id, "text": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn health_reports_memory_backend() {
    let base = spawn_app(RelayConfig::default()).await;
    let client = reqwest::Client::new();
    let body: Value = client
        .get(format!("{base}/api/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["db"], json!(true));
    assert_eq!(body["kind"], json!("memory"));
}
