//! Tool contract consumed by the agent run loop (spec §6).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::ToolResult;

/// Opaque, tool-set-wide context handed to every `Tool::execute` call.
/// The core treats it as inert data threaded through from `AgentState`;
/// concrete shape is owned by whichever binary wires real tools in.
pub type ToolContext = std::sync::Arc<dyn std::any::Any + Send + Sync>;

/// A callable tool. `parameters` is a JSON Schema describing `args`.
///
/// Implementations are expected to catch their own panics/errors and
/// report them as a failure `ToolResult` — the agent loop never expects
/// `execute` to unwind (spec §4.3 step 5: "any thrown error is caught and
/// packaged as a failure ToolResult").
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> serde_json::Value;
    async fn execute(&self, args: serde_json::Value, context: Option<&ToolContext>, cancel: &CancellationToken) -> ToolResult;
}

/// The distinguished tool name whose successful result carries the
/// user-visible reply (spec §4.3, §9 — kept as a configurable constant
/// rather than a hardcoded literal scattered through the loop).
pub const EMA_REPLY_TOOL_NAME: &str = "ema_reply";
