//! Wire-adjacent data model shared by the agent loop, the actor worker and
//! the conversation/job stores (spec §3).

use serde::{Deserialize, Serialize};

/// A discriminated content value. Only `Text` is accepted end to end today;
/// other variants parse at the boundary but are rejected with a validation
/// error until the core grows support for them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { text: String },
    /// Accepted at the boundary, rejected by `ActorWorker::work`.
    Image { url: String },
}

impl Content {
    pub fn text(s: impl Into<String>) -> Self {
        Content::Text { text: s.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Content::Text { .. })
    }
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Value,
    /// Opaque signature some providers attach to a tool call's "thought";
    /// round-tripped verbatim, never interpreted by the core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

/// Outcome of executing a `ToolCall`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self { success: true, content: Some(content.into()), error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, content: None, error: Some(error.into()) }
    }
}

/// One turn of the conversation as seen by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        contents: Vec<Content>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Model {
        contents: Vec<Content>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
    },
    Tool {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        result: ToolResult,
    },
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User { contents: vec![Content::text(text)], name: None, id: None }
    }

    /// True for a model message carrying at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        matches!(self, Message::Model { tool_calls: Some(calls), .. } if !calls.is_empty())
    }
}

/// Author kind of a persisted conversational turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    User,
    Actor,
}

/// A message enriched for persistence/recall (spec §3).
///
/// Ordering by `time` and insertion position must be preserved by whatever
/// stores this; see `ConversationStore` in `crate::store`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferMessage {
    pub kind: BufferKind,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub contents: Vec<Content>,
    /// Monotonic-enough wall-clock milliseconds.
    pub time: i64,
}

impl BufferMessage {
    pub fn new(kind: BufferKind, contents: Vec<Content>, time: i64) -> Self {
        Self { kind, id: uuid::Uuid::new_v4().to_string(), name: None, contents, time }
    }

    /// Render as `[timestamp] name: text`, used by system-prompt assembly
    /// (spec §4.2.5). `name` falls back to the kind's label when unset.
    pub fn render_line(&self) -> String {
        let name = self.name.clone().unwrap_or_else(|| match self.kind {
            BufferKind::User => "user".to_string(),
            BufferKind::Actor => "actor".to_string(),
        });
        let text: String = self
            .contents
            .iter()
            .filter_map(Content::as_text)
            .collect::<Vec<_>>()
            .join(" ");
        format!("[{}] {}: {}", self.time, name, text)
    }
}

/// The triple identifying a unique Actor Worker instance in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorKey {
    pub user_id: i64,
    pub actor_id: i64,
    pub conversation_id: i64,
}

impl ActorKey {
    pub fn new(user_id: i64, actor_id: i64, conversation_id: i64) -> Self {
        Self { user_id, actor_id, conversation_id }
    }
}

impl std::fmt::Display for ActorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.user_id, self.actor_id, self.conversation_id)
    }
}

/// The actor worker's state machine (spec §4.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorStatus {
    Idle,
    Preparing,
    Running,
}

impl Default for ActorStatus {
    fn default() -> Self {
        ActorStatus::Idle
    }
}

/// A persisted scheduler job (spec §3). `id` is assigned by the store and
/// is an opaque string to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    /// Milliseconds since epoch.
    pub run_at: i64,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<IntervalSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique: Option<serde_json::Value>,
    pub created_at: i64,
}

/// A recurring job's repeat interval: either a fixed duration or a
/// cron-like expression string (accepted, not evaluated — see
/// `DESIGN.md`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntervalSpec {
    Duration { raw: String },
    Cron { expression: String },
}

impl IntervalSpec {
    pub fn duration(raw: impl Into<String>) -> Self {
        IntervalSpec::Duration { raw: raw.into() }
    }
}
