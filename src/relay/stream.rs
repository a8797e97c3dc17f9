//! Pure translation from upstream chunks to outbound events.

use crate::llm::chat::StreamChunk;
use crate::models::event::RelayEvent;

/// Counters reported by the final chunk of a generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnUsage {
    /// `eval_count + prompt_eval_count`
    pub total_tokens: u64,
    pub eval_count: u64,
    /// Seconds.
    pub duration: f64,
}

impl TurnUsage {
    pub fn from_final(chunk: &StreamChunk) -> Self {
        let eval_count = chunk.eval_count.unwrap_or(0);
        let prompt_eval_count = chunk.prompt_eval_count.unwrap_or(0);
        Self {
            total_tokens: eval_count + prompt_eval_count,
            eval_count,
            duration: (chunk.total_duration.unwrap_or(0) as f64) / 1e9,
        }
    }
}

pub fn chunk_event(chunk: &StreamChunk) -> RelayEvent {
    let usage = chunk.done.then(|| TurnUsage::from_final(chunk));
    RelayEvent::Chunk {
        content: chunk.message.content.clone(),
        done: chunk.done,
        total_tokens: usage.map(|u| u.total_tokens),
        eval_count: usage.map(|u| u.eval_count),
        duration: usage.map(|u| u.duration),
    }
}

/// A reply that streamed to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedReply {
    pub content: String,
    pub usage: TurnUsage,
}

/// Per-turn accumulator. Owned by one relay task, never shared.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    content: String,
    usage: Option<TurnUsage>,
}

impl TurnAccumulator {
    pub fn absorb(&mut self, chunk: &StreamChunk) -> RelayEvent {
        self.content.push_str(&chunk.message.content);
        if chunk.done {
            self.usage = Some(TurnUsage::from_final(chunk));
        }
        chunk_event(chunk)
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// `None` unless a final chunk was absorbed.
    pub fn finish(self) -> Option<CompletedReply> {
        let usage = self.usage?;
        Some(CompletedReply { content: self.content, usage })
    }
}
