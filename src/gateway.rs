use crate::cli::Args;
use crate::history::{ initialize_history_store, HistoryStore };
use crate::llm::chat::{ ChatClient, new_client as new_chat_client };
use crate::relay::ChatRelay;

use log::{ info, warn };
use std::error::Error;
use std::sync::Arc;

/// The long-lived collaborators shared by every request.
#[derive(Clone)]
pub struct ChatGateway {
    pub chat_client: Arc<dyn ChatClient>,
    pub history_store: Arc<dyn HistoryStore>,
    pub relay: ChatRelay,
}

impl ChatGateway {
    pub fn new(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let llm_config = args.llm_config();
        let chat_client = new_chat_client(&llm_config)?;
        info!(
            "Chat client configured: BaseURL={}, Timeout={:?}, MaxMalformedLines={}",
            llm_config.base_url,
            llm_config.timeout,
            llm_config.max_malformed_lines
        );

        let history_store = initialize_history_store(args)?;

        Ok(Self::from_parts(chat_client, history_store))
    }

    pub fn from_parts(chat_client: Arc<dyn ChatClient>, history_store: Arc<dyn HistoryStore>) -> Self {
        let relay = ChatRelay::new(chat_client.clone(), history_store.clone());
        Self { chat_client, history_store, relay }
    }

    /// Logs whether the inference service is reachable and what it serves. Never fails startup.
    pub async fn report_upstream(&self, base_url: &str) {
        if !self.chat_client.is_healthy().await {
            warn!("Ollama is not reachable at {}", base_url);
            warn!("Start Ollama first: ollama serve");
            return;
        }

        info!("Ollama connected: {}", base_url);
        match self.chat_client.list_models().await {
            Ok(models) => {
                info!("Available models: {}", models.len());
                for model in &models {
                    info!("  model {} ({:.1}GB)", model.name, (model.size as f64) / 1e9);
                }
            }
            Err(e) => warn!("Could not list models: {}", e),
        }
    }
}
