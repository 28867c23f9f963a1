//! LLM client contract consumed by the agent run loop (spec §6).
//!
//! Only the behavioral contract is specified here; the actual provider
//! wire adapters (OpenAI-compatible, Google) are external collaborators
//! per spec §1. Grounded on the shape of `llm::client::LlmClient::chat` in
//! the teacher crate, generalized to the tool-calling contract spec §6
//! describes.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{Message, ToolCall};
use crate::tool::Tool;

/// One LLM round trip's result.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub message: ModelTurn,
    pub finish_reason: String,
    pub total_tokens: Option<u32>,
}

/// The model's turn: rendered text plus any tool calls it requested.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelTurn {
    pub fn into_message(self) -> Message {
        Message::Model {
            contents: vec![crate::model::Content::text(self.text)],
            tool_calls: if self.tool_calls.is_empty() { None } else { Some(self.tool_calls) },
        }
    }
}

/// The LLM client contract. Implementations are expected to apply their
/// own retry policy internally (spec §4.1/§4.3) and honor `cancel`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[std::sync::Arc<dyn Tool>],
        system_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError>;
}

/// The two error shapes the agent loop distinguishes (spec §4.3 step 2).
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("cancelled")]
    Cancelled,
    #[error("retry exhausted after {attempts} attempt(s): {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
    #[error("{0}")]
    Other(String),
}
