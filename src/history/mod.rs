mod memory;
mod redis;

pub use self::memory::MemoryHistoryStore;
pub use self::redis::RedisHistoryStore;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use thiserror::Error;
use crate::cli::Args;
use crate::models::chat::{ Conversation, HistoryStats, Message };

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("stored record is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unsupported history store type: {0}")]
    UnsupportedBackend(String),
}

/// Durable conversation metadata plus an append-only message log per conversation.
///
/// Implementations serialize their writes; concurrent callers never observe a torn
/// conversation or a reordered message list.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn create_conversation(
        &self,
        id: &str,
        title: &str,
        model: &str
    ) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError>;

    /// Most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError>;

    async fn update_title(&self, id: &str, title: &str) -> Result<(), StoreError>;

    async fn touch(&self, id: &str) -> Result<(), StoreError>;

    /// Removes the conversation and all of its messages. Unknown ids are not an error.
    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError>;

    async fn create_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Chronological. Unknown conversations have no messages.
    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn stats(&self) -> Result<HistoryStats, StoreError> {
        let conversations = self.list_conversations().await?;
        let mut stats = HistoryStats {
            total_conversations: conversations.len() as u64,
            ..HistoryStats::default()
        };
        for convo in &conversations {
            let messages = self.get_messages(&convo.id).await?;
            stats.total_messages += messages.len() as u64;
            stats.total_tokens += messages
                .iter()
                .filter_map(|m| m.tokens_used)
                .sum::<u64>();
        }
        Ok(stats)
    }
}

pub fn create_history_store(args: &Args) -> Result<Arc<dyn HistoryStore>, StoreError> {
    match args.history_type.to_lowercase().as_str() {
        "redis" => {
            let store = RedisHistoryStore::new(&args.history_host, &args.history_redis_prefix)?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(MemoryHistoryStore::default())),
        other => Err(StoreError::UnsupportedBackend(other.to_string())),
    }
}

pub fn initialize_history_store(args: &Args) -> Result<Arc<dyn HistoryStore>, StoreError> {
    info!("Chat history will be stored in: {} at {}", args.history_type, args.history_host);
    create_history_store(args)
}
