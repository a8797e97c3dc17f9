use crate::cli::Args;
use crate::gateway::ChatGateway;
use crate::history::StoreError;
use crate::llm::chat::{ LlmError, ModelInfo };
use crate::llm::chat::lines::UpstreamLine;
use crate::models::chat::{ ChatTurn, Conversation, HistoryStats, Message, DEFAULT_TITLE };
use crate::relay::RelayError;

use std::error::Error;
use std::net::SocketAddr;
use std::time::{ Duration, Instant };
use axum::{
    routing::{ delete, get, post },
    Router,
    Json,
    extract::{ Path, Request, State, rejection::JsonRejection },
    middleware::{ self, Next },
    response::{ IntoResponse, Response, sse::{ Event, Sse } },
    http::{ header, HeaderName, HeaderValue, Method, StatusCode },
};
use futures::StreamExt;
use serde::{ Deserialize, Serialize };
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{ AllowOrigin, Any, CorsLayer };
use log::{ info, warn, error };
use uuid::Uuid;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct AppState {
    gateway: ChatGateway,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::InvalidInput(msg) => ApiError::bad_request(msg),
            RelayError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, "Conversation not found"),
            RelayError::Persistence(msg) => {
                error!("Chat turn failed: {}", msg);
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save message")
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, "Conversation not found"),
            other => {
                error!("History store error: {}", other);
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        }
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        error!("Inference service error: {}", err);
        if err.is_unavailable() {
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "Cannot connect to Ollama. Make sure Ollama is running."
            )
        } else {
            ApiError::new(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    ollama: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Serialize)]
struct ConversationsResponse {
    conversations: Vec<Conversation>,
}

#[derive(Serialize)]
struct ConversationDetail {
    conversation: Conversation,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct MessagesResponse {
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    history: HistoryStats,
    ollama_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    models_count: Option<usize>,
}

#[derive(Deserialize, Default)]
struct CreateConversationRequest {
    #[serde(default)]
    title: String,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct UpdateConversationRequest {
    #[serde(default)]
    title: String,
}

#[derive(Deserialize)]
struct PullModelRequest {
    #[serde(default)]
    name: String,
}

pub fn router(gateway: ChatGateway, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/models", get(list_models_handler))
        .route("/api/models/pull", post(pull_model_handler))
        .route("/api/models/{name}", delete(delete_model_handler))
        .route(
            "/api/conversations",
            get(list_conversations_handler).post(create_conversation_handler)
        )
        .route(
            "/api/conversations/{id}",
            get(get_conversation_handler)
                .patch(update_conversation_handler)
                .delete(delete_conversation_handler)
        )
        .route("/api/conversations/{id}/messages", get(list_messages_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/stats", get(stats_handler))
        .layer(middleware::from_fn(log_requests))
        .layer(cors_layer(allowed_origins))
        .with_state(AppState { gateway })
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
        ])
        .max_age(Duration::from_secs(86400));

    if origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(allowed)).allow_credentials(true)
}

/// Chat streams are long-lived, so they are left out of the access log.
async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    if !path.starts_with("/api/chat") {
        info!("{} {} {} {:?}", method, path, response.status().as_u16(), start.elapsed());
    }
    response
}

pub async fn start_http_server(
    args: &Args,
    gateway: ChatGateway
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr: SocketAddr = tokio::net
        ::lookup_host(args.bind_addr()).await?
        .next()
        .ok_or_else(|| format!("Could not resolve bind address {}", args.bind_addr()))?;
    let app = router(gateway, &args.allowed_origins());

    if args.enable_tls {
        let (cert_path, key_path) = match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
        };
        info!("TLS enabled. Loading certificate from '{}' and key from '{}'", cert_path, key_path);
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            cert_path,
            key_path
        ).await?;

        let handle = axum_server::Handle::new();
        let shutdown = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });

        info!("HTTPS server listening on: https://{}", addr);
        axum_server::bind_rustls(addr, tls_config).handle(handle).serve(app.into_make_service()).await?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("HTTP server listening on: http://{}", addr);
        axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutting down...");
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let ollama = state.gateway.chat_client.is_healthy().await;
    Json(HealthResponse {
        status: if ollama { "healthy" } else { "degraded" },
        ollama,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_models_handler(State(state): State<AppState>) -> Result<Json<ModelsResponse>, ApiError> {
    let models = state.gateway.chat_client.list_models().await?;
    Ok(Json(ModelsResponse { models }))
}

async fn pull_model_handler(
    State(state): State<AppState>,
    body: Result<Json<PullModelRequest>, JsonRejection>
) -> Result<impl IntoResponse, ApiError> {
    let name = match body {
        Ok(Json(req)) if !req.name.trim().is_empty() => req.name.trim().to_string(),
        _ => {
            return Err(ApiError::bad_request("Model name is required"));
        }
    };

    let client = state.gateway.chat_client.clone();
    let (tx, rx) = mpsc::channel::<Result<Event, axum::Error>>(32);

    tokio::spawn(async move {
        let mut progress = match client.pull_model(&name).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Pull of {} failed: {}", name, e);
                let _ = tx.send(error_event(&e.to_string())).await;
                return;
            }
        };
        let mut succeeded = false;
        while let Some(item) = progress.next().await {
            match item {
                Ok(update) => {
                    succeeded |= update.is_final();
                    if tx.send(Event::default().json_data(&update)).await.is_err() {
                        warn!("Client stopped following pull of {}", name);
                        return;
                    }
                }
                Err(e) => {
                    error!("Pull of {} failed: {}", name, e);
                    let _ = tx.send(error_event(&e.to_string())).await;
                    return;
                }
            }
        }
        info!("Pulled model {}", name);
        if !succeeded {
            let _ = tx.send(Event::default().json_data(StatusResponse { status: "success" })).await;
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)))
}

fn error_event(message: &str) -> Result<Event, axum::Error> {
    Event::default().json_data(ErrorResponse { error: message.to_string() })
}

async fn delete_model_handler(
    State(state): State<AppState>,
    Path(name): Path<String>
) -> Result<Json<StatusResponse>, ApiError> {
    state.gateway.chat_client.delete_model(&name).await?;
    Ok(Json(StatusResponse { status: "deleted" }))
}

async fn list_conversations_handler(
    State(state): State<AppState>
) -> Result<Json<ConversationsResponse>, ApiError> {
    let conversations = state.gateway.history_store.list_conversations().await?;
    Ok(Json(ConversationsResponse { conversations }))
}

async fn create_conversation_handler(
    State(state): State<AppState>,
    body: Result<Json<CreateConversationRequest>, JsonRejection>
) -> Result<impl IntoResponse, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let title = match req.title.trim() {
        "" => DEFAULT_TITLE,
        title => title,
    };

    let id = Uuid::new_v4().to_string();
    let convo = state.gateway.history_store.create_conversation(&id, title, &req.model).await?;
    Ok((StatusCode::CREATED, Json(convo)))
}

async fn get_conversation_handler(
    State(state): State<AppState>,
    Path(id): Path<String>
) -> Result<Json<ConversationDetail>, ApiError> {
    let store = &state.gateway.history_store;
    let conversation = store.get_conversation(&id).await?;
    let messages = store.get_messages(&id).await?;
    Ok(Json(ConversationDetail { conversation, messages }))
}

async fn update_conversation_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<UpdateConversationRequest>, JsonRejection>
) -> Result<Json<StatusResponse>, ApiError> {
    let title = match body {
        Ok(Json(req)) if !req.title.trim().is_empty() => req.title.trim().to_string(),
        _ => {
            return Err(ApiError::bad_request("Title is required"));
        }
    };
    state.gateway.history_store.update_title(&id, &title).await?;
    Ok(Json(StatusResponse { status: "updated" }))
}

async fn delete_conversation_handler(
    State(state): State<AppState>,
    Path(id): Path<String>
) -> Result<Json<StatusResponse>, ApiError> {
    state.gateway.history_store.delete_conversation(&id).await?;
    Ok(Json(StatusResponse { status: "deleted" }))
}

async fn list_messages_handler(
    State(state): State<AppState>,
    Path(id): Path<String>
) -> Result<Json<MessagesResponse>, ApiError> {
    let messages = state.gateway.history_store.get_messages(&id).await?;
    Ok(Json(MessagesResponse { messages }))
}

/// Either a JSON error before anything is streamed, or an event stream that ends with a
/// `done` chunk or an `error` event.
async fn chat_handler(
    State(state): State<AppState>,
    body: Result<Json<ChatTurn>, JsonRejection>
) -> Result<impl IntoResponse, ApiError> {
    let Json(turn) = body.map_err(|e| {
        warn!("Rejected chat request: {}", e);
        ApiError::bad_request("Invalid request body")
    })?;

    let events = state.gateway.relay.start(turn).await?;
    let stream = events.map(|event| Event::default().json_data(&event));

    Ok(([("x-accel-buffering", "no")], Sse::new(stream)))
}

async fn stats_handler(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let history = state.gateway.history_store.stats().await?;
    let client = &state.gateway.chat_client;
    let ollama_connected = client.is_healthy().await;
    let models_count = match client.list_models().await {
        Ok(models) => Some(models.len()),
        Err(_) => None,
    };

    Ok(Json(StatsResponse { history, ollama_connected, models_count }))
}
