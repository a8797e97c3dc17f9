//! One chat turn, from validated request to persisted reply.
//!
//! [`ChatRelay::start`] runs the synchronous part of a turn (validation, conversation
//! bootstrap, persisting the user message, loading history). Anything that fails there is
//! returned as a [`RelayError`] and no stream exists. Once it returns `Ok`, every later
//! failure is reported in-band as a terminal [`RelayEvent::Error`].

pub mod stream;
pub mod title;

use futures::StreamExt;
use log::{ debug, error, info, warn };
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use self::stream::{ CompletedReply, TurnAccumulator };
use self::title::TitleTask;
use crate::history::{ HistoryStore, StoreError };
use crate::llm::chat::{ ChatClient, ChatMessage, ChatRequest };
use crate::models::chat::{ ChatTurn, GenerationOptions, Message, DEFAULT_TITLE };
use crate::models::event::RelayEvent;

const EVENT_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Persistence(String),
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => RelayError::NotFound(id),
            other => RelayError::Persistence(other.to_string()),
        }
    }
}

/// Outbound events of one turn, in emission order. Ends after the terminal event.
pub type RelayStream = ReceiverStream<RelayEvent>;

#[derive(Clone)]
pub struct ChatRelay {
    client: Arc<dyn ChatClient>,
    store: Arc<dyn HistoryStore>,
}

/// Everything the streaming phase needs, owned, so it can move onto its own task.
struct PreparedTurn {
    conversation_id: String,
    model: String,
    user_message: String,
    history: Vec<ChatMessage>,
    options: Option<GenerationOptions>,
    first_exchange: bool,
}

impl ChatRelay {
    pub fn new(client: Arc<dyn ChatClient>, store: Arc<dyn HistoryStore>) -> Self {
        Self { client, store }
    }

    pub async fn start(&self, turn: ChatTurn) -> Result<RelayStream, RelayError> {
        validate(&turn)?;
        let prepared = self.initialize(turn).await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let relay = self.clone();
        tokio::spawn(async move { relay.stream_turn(prepared, tx).await });

        Ok(ReceiverStream::new(rx))
    }

    async fn initialize(&self, turn: ChatTurn) -> Result<PreparedTurn, RelayError> {
        let conversation_id = match turn.existing_conversation() {
            Some(id) => {
                self.store.get_conversation(id).await?;
                id.to_string()
            }
            None => {
                let id = Uuid::new_v4().to_string();
                self.store.create_conversation(&id, DEFAULT_TITLE, &turn.model).await?;
                info!("Created conversation {} for model {}", id, turn.model);
                id
            }
        };

        let user_msg = Message::user(&conversation_id, &turn.message);
        self.store.create_message(&user_msg).await.map_err(|e| {
            error!("Failed to save user message in {}: {}", conversation_id, e);
            RelayError::Persistence(e.to_string())
        })?;

        let history = self.store
            .get_messages(&conversation_id).await
            .map_err(|e| RelayError::Persistence(e.to_string()))?;
        let first_exchange = history.len() <= 1;
        let history: Vec<ChatMessage> = history.iter().map(ChatMessage::from).collect();

        debug!(
            "Turn ready: conversation={}, model={}, history={}",
            conversation_id,
            turn.model,
            history.len()
        );

        Ok(PreparedTurn {
            conversation_id,
            model: turn.model,
            user_message: turn.message,
            history,
            options: turn.options,
            first_exchange,
        })
    }

    async fn stream_turn(self, turn: PreparedTurn, tx: mpsc::Sender<RelayEvent>) {
        let PreparedTurn {
            conversation_id,
            model,
            user_message,
            history,
            options,
            first_exchange,
        } = turn;

        if tx.send(RelayEvent::init(&conversation_id)).await.is_err() {
            warn!("Client left before the stream for {} started", conversation_id);
            return;
        }

        let request = ChatRequest::new(&model, history).with_options(options);
        let reply = match self.relay_upstream(request, &tx).await {
            Some(reply) => reply,
            None => {
                return;
            }
        };

        self.finalize(&conversation_id, &model, reply).await;

        if first_exchange {
            TitleTask { conversation_id, model, user_message }.spawn(
                self.client.clone(),
                self.store.clone()
            );
        }
    }

    /// Forwards upstream chunks as they arrive. `None` means the turn failed or the client
    /// went away; whatever could be reported has been sent already.
    async fn relay_upstream(
        &self,
        request: ChatRequest,
        tx: &mpsc::Sender<RelayEvent>
    ) -> Option<CompletedReply> {
        let mut upstream = match self.client.stream_chat(request).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Chat stream failed to open: {}", e);
                let _ = tx.send(RelayEvent::error(e)).await;
                return None;
            }
        };

        let mut acc = TurnAccumulator::default();
        loop {
            let item = tokio::select! {
                _ = tx.closed() => {
                    warn!("Client disconnected mid-stream, abandoning reply");
                    return None;
                }
                item = upstream.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            match item {
                Ok(chunk) => {
                    let done = chunk.done;
                    if tx.send(acc.absorb(&chunk)).await.is_err() {
                        warn!("Client disconnected mid-stream, abandoning reply");
                        return None;
                    }
                    if done {
                        break;
                    }
                }
                Err(e) => {
                    error!("Chat stream failed: {}", e);
                    let _ = tx.send(RelayEvent::error(e)).await;
                    return None;
                }
            }
        }

        let received = acc.content().len();
        match acc.finish() {
            Some(reply) => Some(reply),
            None => {
                error!("Upstream closed the stream before completion ({} bytes received)", received);
                let _ = tx.send(
                    RelayEvent::error("inference service closed the stream before completion")
                ).await;
                None
            }
        }
    }

    /// Best effort: the client already has the whole reply, so failures are only logged.
    async fn finalize(&self, conversation_id: &str, model: &str, reply: CompletedReply) {
        let assistant_msg = Message::assistant(
            conversation_id,
            reply.content,
            model,
            reply.usage.total_tokens,
            reply.usage.duration
        );
        if let Err(e) = self.store.create_message(&assistant_msg).await {
            error!("Failed to save assistant message in {}: {}", conversation_id, e);
        }
        if let Err(e) = self.store.touch(conversation_id).await {
            error!("Failed to touch conversation {}: {}", conversation_id, e);
        }
    }
}

fn validate(turn: &ChatTurn) -> Result<(), RelayError> {
    if turn.message.trim().is_empty() || turn.model.trim().is_empty() {
        return Err(RelayError::InvalidInput("Message and model are required".to_string()));
    }
    Ok(())
}
