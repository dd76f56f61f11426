//! Reply generation for Notify messages.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::workflow::checkpoint::HistoryEntry;
use crate::workflow::types::Message;

const NOTIFICATION_PREAMBLE: &str = "\
You are an assistant that acknowledges Slack messages on behalf of a busy team lead. \
Write a brief, professional acknowledgement for information that does not need a \
direct answer. Keep it to one or two sentences, do not ask questions, and do not \
promise any action. Reply with the acknowledgement text only.";

/// Produces reply text for a message.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate_reply(
        &self,
        message: &Message,
        history: &[HistoryEntry],
    ) -> Result<String, LlmError>;
}

/// `ReplyGenerator` backed by an LLM provider.
pub struct LlmReplyGenerator {
    llm: Arc<dyn LlmProvider>,
}

impl LlmReplyGenerator {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

/// Render recent channel history as prompt context.
pub(crate) fn format_history(history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return "(no earlier messages)".to_string();
    }
    history
        .iter()
        .map(|h| format!("[{}] {}: {}", h.received_at.format("%H:%M"), h.sender, h.text))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl ReplyGenerator for LlmReplyGenerator {
    async fn generate_reply(
        &self,
        message: &Message,
        history: &[HistoryEntry],
    ) -> Result<String, LlmError> {
        let prompt = format!(
            "Recent messages in this channel:\n{}\n\n\
             Write an acknowledgement for this message:\n\
             Channel: {}\nFrom: {}\nMessage: {}\nReasoning: {}",
            format_history(history),
            message.channel,
            message.sender,
            message.text,
            message.reasoning.as_deref().unwrap_or("-"),
        );

        let request = CompletionRequest::new(vec![
            ChatMessage::system(NOTIFICATION_PREAMBLE),
            ChatMessage::user(prompt),
        ])
        .with_max_tokens(300)
        .with_temperature(0.3);

        let response = self.llm.complete(request).await?;
        let text = response.content.trim();
        if text.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "empty reply".to_string(),
            });
        }
        Ok(text.to_string())
    }
}
