//! End-to-end tests over a real listener with a scripted LLM.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use relay::{MockLlm, MockTurn, Services};
use serde_json::Value;
use serve::serve_with_services;
use tokio::net::TcpListener;

struct TestServer {
    _dir: tempfile::TempDir,
    addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

async fn start_server(turns: Vec<MockTurn>, max_sse_connections: usize) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let settings = config::Settings {
        db_path: dir.path().join("relay.db").to_string_lossy().into_owned(),
        upload_dir: dir.path().join("uploads").to_string_lossy().into_owned(),
        max_sse_connections,
        ..config::Settings::default()
    };
    let mut services = Services::build(&settings).await.unwrap();
    services.set_llm("local", Arc::new(MockLlm::new(turns)));
    let services = Arc::new(services);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let _ = serve_with_services(listener, services).await;
    });
    TestServer {
        _dir: dir,
        addr,
        _task: task,
    }
}

/// Reads SSE data frames until a terminal frame (or the stream ends).
async fn collect_events(response: reqwest::Response) -> Vec<Value> {
    let mut events = Vec::new();
    let mut buffer = String::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(_) => break,
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(idx) = buffer.find('\n') {
            let line: String = buffer.drain(..=idx).collect();
            let line = line.trim();
            if let Some(payload) = line.strip_prefix("data: ") {
                if let Ok(value) = serde_json::from_str::<Value>(payload) {
                    let terminal =
                        value.get("done").is_some() || value.get("error").is_some();
                    events.push(value);
                    if terminal {
                        return events;
                    }
                }
            }
        }
    }
    events
}

#[tokio::test]
async fn user_is_created_lazily() {
    let server = start_server(vec![MockTurn::text("hi")], 10).await;
    let client = reqwest::Client::new();
    let body: Value = client
        .get(format!("http://{}/api/user", server.addr))
        .query(&[("userId", "u1"), ("displayName", "Ada")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["id"], "u1");
    assert_eq!(body["data"]["displayName"], "Ada");
}

#[tokio::test]
async fn chat_streams_init_content_done_and_persists() {
    let server = start_server(vec![MockTurn::text("The answer is 4.")], 10).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/api/chat", server.addr))
        .json(&serde_json::json!({
            "message": "what is 2+2?",
            "userId": "u1",
            "modelType": "local",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let events = collect_events(response).await;
    assert_eq!(events.first().unwrap()["type"], "init");
    let conversation_id = events[0]["conversationId"].as_str().unwrap().to_string();
    assert!(events
        .iter()
        .any(|e| e["content"] == "The answer is 4."));
    assert_eq!(events.last().unwrap()["done"], true);

    // The conversation now holds the user and assistant messages.
    let listed: Value = client
        .get(format!("http://{}/api/conversations", server.addr))
        .query(&[("userId", "u1")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["data"]["total"], 1);

    let detail: Value = client
        .get(format!(
            "http://{}/api/conversations/{}",
            server.addr, conversation_id
        ))
        .query(&[("userId", "u1")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = detail["data"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "The answer is 4.");
}

#[tokio::test]
async fn at_capacity_chat_returns_429_with_queue_headers() {
    let server = start_server(vec![MockTurn::text("hi")], 0).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/chat", server.addr))
        .json(&serde_json::json!({ "message": "hello", "userId": "u1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    assert!(response.headers().get("x-queue-token").is_some());
    assert!(response.headers().get("x-queue-position").is_some());
    assert!(response.headers().get("retry-after").is_some());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn metrics_and_tool_status_report() {
    let server = start_server(vec![MockTurn::text("hi")], 10).await;
    let client = reqwest::Client::new();

    let metrics: Value = client
        .get(format!("http://{}/api/metrics", server.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["success"], true);
    assert!(metrics["data"]["llm_queue"]["processed"].is_u64());
    assert_eq!(metrics["data"]["admission"]["active_streams"], 0);

    let tools: Value = client
        .get(format!("http://{}/api/tool-system/status", server.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = tools["data"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["tool"].as_str())
        .collect();
    assert!(names.contains(&"get_time"));
}

#[tokio::test]
async fn unknown_model_type_is_a_plain_json_error() {
    let server = start_server(vec![MockTurn::text("hi")], 10).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/chat", server.addr))
        .json(&serde_json::json!({
            "message": "hello",
            "userId": "u1",
            "modelType": "volcano",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn lru_trigger_runs_a_sweep() {
    let server = start_server(vec![MockTurn::text("hi")], 10).await;
    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("http://{}/api/admin/lru-status/trigger", server.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert!(body["data"]["archived_idle"].is_u64());
}
