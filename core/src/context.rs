//! Context holder (spec §2 C4, §3 `AgentState`).
//!
//! Owned by exactly one agent run; may be retained across runs only via
//! the resume rule in spec §4.2.2.

use std::sync::Arc;

use crate::model::Message;
use crate::tool::{Tool, ToolContext};

/// The per-run triple of prompt, messages, tools, plus an opaque tool
/// context (spec §3 `AgentState`).
pub struct AgentState {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub tool_context: Option<ToolContext>,
}

impl AgentState {
    pub fn new(system_prompt: String, messages: Vec<Message>, tools: Vec<Arc<dyn Tool>>, tool_context: Option<ToolContext>) -> Self {
        Self { system_prompt, messages, tools, tool_context }
    }

    pub fn find_tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Append a batch of user-authored messages to the existing history,
    /// the shape the resume-after-abort rule needs (spec §4.2.2 step 2,
    /// P5). Repairs a trailing model message with unfinished tool calls
    /// first — see `repair_trailing_pending_tool_calls` and the Open
    /// Question resolution in `DESIGN.md`.
    pub fn extend_with_user_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.repair_trailing_pending_tool_calls();
        self.messages.extend(messages);
    }

    /// If the most recent model message requested tool calls that were
    /// never all answered (the run was aborted mid tool-execution), drop
    /// the calls with no matching tool-result message so the resumed
    /// history never has a model message whose tool_calls outrun its
    /// tool responses — most LLM wire formats reject that shape.
    ///
    /// Spec §9 flags this as unspecified and suggests exactly this
    /// "drop trailing pending tool calls before append" policy; this is
    /// the chosen resolution (see `DESIGN.md`).
    pub fn repair_trailing_pending_tool_calls(&mut self) {
        let Some(model_idx) = self
            .messages
            .iter()
            .rposition(|m| matches!(m, Message::Model { tool_calls: Some(calls), .. } if !calls.is_empty()))
        else {
            return;
        };

        let answered = self.messages[model_idx + 1..]
            .iter()
            .filter(|m| matches!(m, Message::Tool { .. }))
            .count();

        if let Message::Model { tool_calls: Some(calls), .. } = &mut self.messages[model_idx] {
            if answered < calls.len() {
                calls.truncate(answered);
            }
        }
    }
}
