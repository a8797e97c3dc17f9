use log::{ info, warn };
use std::sync::Arc;

use crate::history::HistoryStore;
use crate::llm::chat::{ ChatClient, ChatMessage, ChatRequest };
use crate::models::chat::GenerationOptions;

pub const TITLE_INSTRUCTION: &str =
    "Generate a very short title (max 6 words) for a conversation that starts with the following message. Reply with ONLY the title, no quotes, no punctuation at the end.";
pub const MAX_TITLE_CHARS: usize = 80;

/// Trims, drops empty results and caps the length at a character boundary.
pub fn normalize_title(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let capped: String = trimmed.chars().take(MAX_TITLE_CHARS).collect();
    Some(capped.trim_end().to_string())
}

pub fn title_request(model: &str, user_message: &str) -> ChatRequest {
    let messages = vec![
        ChatMessage::new("system", TITLE_INSTRUCTION),
        ChatMessage::new("user", user_message)
    ];
    ChatRequest::new(model, messages).with_options(
        Some(GenerationOptions {
            temperature: Some(0.3),
            num_predict: Some(20),
            ..GenerationOptions::default()
        })
    )
}

/// Renames a conversation after its first exchange. Holds only owned copies of what it needs.
pub struct TitleTask {
    pub conversation_id: String,
    pub model: String,
    pub user_message: String,
}

impl TitleTask {
    pub fn spawn(
        self,
        client: Arc<dyn ChatClient>,
        store: Arc<dyn HistoryStore>
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(client.as_ref(), store.as_ref()).await })
    }

    async fn run(self, client: &dyn ChatClient, store: &dyn HistoryStore) {
        let response = match client.chat(title_request(&self.model, &self.user_message)).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Auto title failed for {}: {}", self.conversation_id, e);
                return;
            }
        };

        let Some(title) = normalize_title(&response.message.content) else {
            warn!("Auto title for {} came back empty", self.conversation_id);
            return;
        };

        match store.update_title(&self.conversation_id, &title).await {
            Ok(()) => info!("Titled conversation {}: {}", self.conversation_id, title),
            Err(e) => warn!("Failed to store title for {}: {}", self.conversation_id, e),
        }
    }
}
