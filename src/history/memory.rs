use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::history::{ HistoryStore, StoreError };
use crate::models::chat::{ Conversation, Message };

#[derive(Default)]
struct State {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<Message>>,
}

/// Process-local store. One lock guards everything, which gives the single-writer discipline.
#[derive(Default)]
pub struct MemoryHistoryStore {
    state: Mutex<State>,
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn create_conversation(
        &self,
        id: &str,
        title: &str,
        model: &str
    ) -> Result<Conversation, StoreError> {
        let convo = Conversation::new(id, title, model);
        let mut state = self.state.lock().await;
        state.conversations.insert(id.to_string(), convo.clone());
        Ok(convo)
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        let state = self.state.lock().await;
        state.conversations
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let state = self.state.lock().await;
        let mut convos: Vec<Conversation> = state.conversations.values().cloned().collect();
        convos.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(convos)
    }

    async fn update_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let convo = state.conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        convo.title = title.to_string();
        convo.touch();
        Ok(())
    }

    async fn touch(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let convo = state.conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        convo.touch();
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.conversations.remove(id);
        state.messages.remove(id);
        Ok(())
    }

    async fn create_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.conversations.contains_key(&message.conversation_id) {
            return Err(StoreError::NotFound(message.conversation_id.clone()));
        }
        let log = state.messages.entry(message.conversation_id.clone()).or_default();
        // equal timestamps keep insertion order
        let at = log.partition_point(|m| m.created_at <= message.created_at);
        log.insert(at, message.clone());
        Ok(())
    }

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.messages.get(conversation_id).cloned().unwrap_or_default())
    }
}
