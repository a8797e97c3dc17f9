pub mod lines;
pub mod ollama;

use async_trait::async_trait;
use futures::Stream;
use serde::{ Deserialize, Serialize };
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use super::LlmConfig;
use self::lines::UpstreamLine;
use self::ollama::OllamaClient;
use crate::models::chat::{ GenerationOptions, Message };

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned status {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl LlmError {
    /// True when the upstream could not be reached at all, as opposed to answering badly.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LlmError::Transport(_))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self { role: role.to_string(), content: content.to_string() }
    }
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        Self { role: msg.role.to_string(), content: msg.content.clone() }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<GenerationOptions>,
}

impl ChatRequest {
    pub fn new(model: &str, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.to_string(),
            messages,
            stream: false,
            options: None,
        }
    }

    pub fn with_options(mut self, options: Option<GenerationOptions>) -> Self {
        self.options = options;
        self
    }
}

/// One `/api/chat` response object: a whole reply, or one line of a streamed reply.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ChatResponse {
    pub model: String,
    pub created_at: Option<String>,
    pub message: ChatMessage,
    pub done: bool,
    pub done_reason: Option<String>,
    /// Nanoseconds.
    pub total_duration: Option<u64>,
    pub load_duration: Option<u64>,
    pub prompt_eval_count: Option<u64>,
    pub prompt_eval_duration: Option<u64>,
    pub eval_count: Option<u64>,
    pub eval_duration: Option<u64>,
    pub error: Option<String>,
}

pub type StreamChunk = ChatResponse;

impl UpstreamLine for ChatResponse {
    fn upstream_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn is_final(&self) -> bool {
        self.done
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ModelDetails {
    pub parent_model: String,
    pub format: String,
    pub family: String,
    pub families: Option<Vec<String>>,
    pub parameter_size: String,
    pub quantization_level: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub details: ModelDetails,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpstreamLine for PullProgress {
    fn upstream_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn is_final(&self) -> bool {
        self.status == "success"
    }
}

/// Forward-only, single-consumer sequence of decoded upstream lines.
pub type UpstreamStream<T> = Pin<Box<dyn Stream<Item = Result<T, LlmError>> + Send>>;
pub type ChunkStream = UpstreamStream<StreamChunk>;
pub type PullStream = UpstreamStream<PullProgress>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Opens a streamed chat. Status and transport failures surface here, before any chunk.
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, LlmError>;

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError>;

    async fn pull_model(&self, name: &str) -> Result<PullStream, LlmError>;

    async fn delete_model(&self, name: &str) -> Result<(), LlmError>;

    /// Reachability probe. Never fails, any problem reads as `false`.
    async fn is_healthy(&self) -> bool;
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, LlmError> {
    let client = OllamaClient::from_config(config)?;
    Ok(Arc::new(client))
}
