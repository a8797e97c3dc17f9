use serde::{ Serialize, Deserialize };

/// Payload of one outbound server-sent event on the chat stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum RelayEvent {
    #[serde(rename = "init")] Init {
        conversation_id: String,
    },
    #[serde(rename = "chunk")] Chunk {
        content: String,
        done: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eval_count: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    #[serde(rename = "error")] Error {
        error: String,
    },
}

impl RelayEvent {
    pub fn init(conversation_id: &str) -> Self {
        RelayEvent::Init { conversation_id: conversation_id.to_string() }
    }

    pub fn error(error: impl ToString) -> Self {
        RelayEvent::Error { error: error.to_string() }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            RelayEvent::Chunk { done, .. } => *done,
            RelayEvent::Error { .. } => true,
            RelayEvent::Init { .. } => false,
        }
    }
}
