use axum::body::Body;
use axum::http::{ header, Method, Request, StatusCode };
use axum::Router;
use chat_gateway::gateway::ChatGateway;
use chat_gateway::history::{ HistoryStore, MemoryHistoryStore };
use chat_gateway::llm::chat::ollama::OllamaClient;
use serde_json::{ json, Value };
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{ body_partial_json, method, path };
use wiremock::{ Mock, MockServer, ResponseTemplate };

struct TestApp {
    router: Router,
    store: Arc<MemoryHistoryStore>,
    _upstream: MockServer,
}

async fn setup(upstream: MockServer) -> TestApp {
    let client = Arc::new(OllamaClient::new(&upstream.uri(), Duration::from_secs(5), 4).unwrap());
    let store = Arc::new(MemoryHistoryStore::default());
    let gateway = ChatGateway::from_parts(client, store.clone());
    let router = chat_gateway::server::api::router(gateway, &["http://localhost:3000".to_string()]);
    TestApp { router, store, _upstream: upstream }
}

async fn mock_chat_stream(server: &MockServer, words: &[&str]) {
    let mut body = String::new();
    for word in words {
        body.push_str(
            &json!({"model":"llama3","message":{"role":"assistant","content":word},"done":false}).to_string()
        );
        body.push('\n');
    }
    body.push_str(
        &json!({"model":"llama3","message":{"role":"assistant","content":""},"done":true,
                "eval_count":words.len(),"prompt_eval_count":5,"total_duration":2000000000u64}).to_string()
    );
    body.push('\n');

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"stream":true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(server).await;
}

async fn mock_title(server: &MockServer, title: &str) {
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"stream":false})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(
                json!({"model":"llama3","message":{"role":"assistant","content":title},"done":true})
            )
        )
        .mount(server).await;
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) =>
            builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(router, method, uri, body).await;
    let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, json)
}

fn sse_events(bytes: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

async fn wait_for_title(store: &MemoryHistoryStore, id: &str, expected: &str) {
    for _ in 0..100 {
        if store.get_conversation(id).await.unwrap().title == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("title never became {expected}");
}

#[tokio::test]
async fn chat_streams_a_first_turn_and_persists_it() {
    let upstream = MockServer::start().await;
    mock_chat_stream(&upstream, &["Hi", " there"]).await;
    mock_title(&upstream, "  Friendly greeting \n").await;
    let app = setup(upstream).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"model":"llama3","message":"Hello"}).to_string()))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(response.headers()["x-accel-buffering"], "no");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let events = sse_events(&bytes);
    assert_eq!(events.len(), 4);
    assert_eq!(events[0]["type"], "init");
    let id = events[0]["conversation_id"].as_str().unwrap().to_string();
    assert_eq!(events[1]["content"], "Hi");
    assert_eq!(events[2]["content"], " there");
    assert_eq!(events[3]["done"], true);
    assert_eq!(events[3]["eval_count"], 2);
    assert_eq!(events[3]["total_tokens"], 7);

    wait_for_title(&app.store, &id, "Friendly greeting").await;

    let (status, detail) = send_json(&app.router, Method::GET, &format!("/api/conversations/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["conversation"]["model"], "llama3");
    let messages = detail["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "Hi there");
    assert_eq!(messages[1]["tokens_used"], 7);
    assert_eq!(messages[1]["duration"], 2.0);
}

#[tokio::test]
async fn chat_rejects_bad_input_before_streaming() {
    let app = setup(MockServer::start().await).await;

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/chat",
        Some(json!({"model":"llama3","message":"   "}))
    ).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = send_json(
        &app.router,
        Method::POST,
        "/api/chat",
        Some(json!({"model":"llama3","message":"Hi","conversation_id":"nope"}))
    ).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app.router, Method::POST, "/api/chat", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body.is_empty());

    assert!(app.store.list_conversations().await.unwrap().is_empty());
}

#[tokio::test]
async fn chat_reports_upstream_refusal_inside_the_stream() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model not found"))
        .mount(&upstream).await;
    let app = setup(upstream).await;

    let (status, bytes) = send(
        &app.router,
        Method::POST,
        "/api/chat",
        Some(json!({"model":"ghost","message":"Hello"}))
    ).await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_events(&bytes);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["type"], "init");
    assert_eq!(events[1]["type"], "error");

    let id = events[0]["conversation_id"].as_str().unwrap();
    let messages = app.store.get_messages(id).await.unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn conversation_crud_round_trip() {
    let app = setup(MockServer::start().await).await;

    let (status, created) = send_json(
        &app.router,
        Method::POST,
        "/api/conversations",
        Some(json!({"model":"llama3"}))
    ).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["title"], "New Chat");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, _) = send_json(&app.router, Method::POST, "/api/conversations", None).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, listed) = send_json(&app.router, Method::GET, "/api/conversations", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["conversations"].as_array().unwrap().len(), 2);

    let uri = format!("/api/conversations/{id}");
    let (status, _) = send_json(&app.router, Method::PATCH, &uri, Some(json!({"title":"  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send_json(&app.router, Method::PATCH, &uri, Some(json!({"title":"Renamed"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "updated");

    let (_, listed) = send_json(&app.router, Method::GET, "/api/conversations", None).await;
    assert_eq!(listed["conversations"][0]["title"], "Renamed");

    let (status, _) = send_json(
        &app.router,
        Method::PATCH,
        "/api/conversations/missing",
        Some(json!({"title":"x"}))
    ).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, messages) = send_json(&app.router, Method::GET, &format!("{uri}/messages"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(messages["messages"], json!([]));

    let (status, body) = send_json(&app.router, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "deleted");

    let (status, body) = send_json(&app.router, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Conversation not found");
}

#[tokio::test]
async fn health_models_and_stats_reflect_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models":[{"name":"llama3:latest"}]})))
        .mount(&upstream).await;
    let app = setup(upstream).await;

    let (status, health) = send_json(&app.router, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["ollama"], true);

    let (status, models) = send_json(&app.router, Method::GET, "/api/models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(models["models"][0]["name"], "llama3:latest");

    send_json(&app.router, Method::POST, "/api/conversations", Some(json!({"title":"One"}))).await;
    let (status, stats) = send_json(&app.router, Method::GET, "/api/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_conversations"], 1);
    assert_eq!(stats["total_messages"], 0);
    assert_eq!(stats["ollama_connected"], true);
    assert_eq!(stats["models_count"], 1);
}

#[tokio::test]
async fn unreachable_upstream_degrades_health_and_fails_models() {
    let client = Arc::new(OllamaClient::new("http://127.0.0.1:1", Duration::from_secs(2), 4).unwrap());
    let gateway = ChatGateway::from_parts(client, Arc::new(MemoryHistoryStore::default()));
    let router = chat_gateway::server::api::router(gateway, &["*".to_string()]);

    let (status, health) = send_json(&router, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");

    let (status, body) = send_json(&router, Method::GET, "/api/models", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("Ollama"));

    let (_, stats) = send_json(&router, Method::GET, "/api/stats", None).await;
    assert_eq!(stats["ollama_connected"], false);
    assert!(stats.get("models_count").is_none());
}

#[tokio::test]
async fn pull_streams_progress_and_requires_a_name() {
    let upstream = MockServer::start().await;
    let body = format!(
        "{}\n{}\n",
        json!({"status":"pulling manifest"}),
        json!({"status":"success"})
    );
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&upstream).await;
    let app = setup(upstream).await;

    let (status, _) = send_json(&app.router, Method::POST, "/api/models/pull", Some(json!({"name":""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, bytes) = send(&app.router, Method::POST, "/api/models/pull", Some(json!({"name":"llama3"}))).await;
    assert_eq!(status, StatusCode::OK);
    let events = sse_events(&bytes);
    assert_eq!(events.first().unwrap()["status"], "pulling manifest");
    assert_eq!(events.last().unwrap(), &json!({"status":"success"}));
}

#[tokio::test]
async fn cors_preflight_allows_the_frontend() {
    let app = setup(MockServer::start().await).await;
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/chat")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
        .body(Body::empty())
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:3000"
    );
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
}
