//! Agent run loop (spec §2 C5, §4.3).
//!
//! A bounded reasoning loop that interleaves LLM calls and tool
//! executions over a `Context`/`AgentState`, emitting `AgentEvent`s and
//! honoring cooperative cancellation.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::AgentState;
use crate::error::EmaError;
use crate::events::{parse_ema_reply, AgentEvent, EventBus};
use crate::llm::{LlmClient, LlmError};
use crate::model::{Message, ToolResult};
use crate::tool::EMA_REPLY_TOOL_NAME;

/// Runs the bounded reasoning loop over `state`.
///
/// `cancel` is the worker's abort signal (spec §4.2, §5): a single token
/// shared with the in-flight LLM call and the in-flight tool.
#[tracing::instrument(skip_all, fields(max_steps))]
pub async fn run(
    state: &mut AgentState,
    llm: &dyn LlmClient,
    max_steps: usize,
    cancel: &CancellationToken,
    bus: &EventBus<AgentEvent>,
) {
    for step in 1..=max_steps {
        if cancel.is_cancelled() {
            emit_aborted(bus);
            return;
        }

        let response = llm.generate(&state.messages, &state.tools, &state.system_prompt, cancel).await;

        let response = match response {
            Ok(r) => r,
            Err(LlmError::Cancelled) => {
                emit_aborted(bus);
                return;
            }
            Err(LlmError::RetryExhausted { attempts, last_error }) => {
                let msg = format!("LLM call failed after {attempts} attempt(s): {last_error}");
                warn!(attempts, %last_error, "retry exhausted");
                bus.emit(&AgentEvent::RunFinished {
                    ok: false,
                    msg,
                    error: Some(EmaError::RetryExhausted { attempts, last_error }.to_string()),
                });
                return;
            }
            Err(LlmError::Other(e)) => {
                // Spec §4.3 step 2 / §9 Open Questions: this error shape is
                // logged and the run ends silently, with no `runFinished`.
                // Preserved intentionally, not a bug we're free to fix.
                error!(error = %e, "llm generate failed with an error that is neither cancellation nor retry-exhaustion; ending run silently");
                return;
            }
        };

        let finish_reason = response.finish_reason.clone();
        let model_message = response.message.into_message();
        let has_tool_calls = model_message.has_tool_calls();
        state.messages.push(model_message);

        if !has_tool_calls {
            bus.emit(&AgentEvent::RunFinished { ok: true, msg: finish_reason, error: None });
            return;
        }

        let Message::Model { tool_calls: Some(calls), .. } = state.messages.last().cloned().unwrap() else {
            unreachable!("has_tool_calls implies a Model message with tool_calls");
        };

        for call in calls {
            if cancel.is_cancelled() {
                emit_aborted(bus);
                return;
            }

            let result = match state.find_tool(&call.name) {
                Some(tool) => {
                    let tool = Arc::clone(tool);
                    tool.execute(call.args.clone(), state.tool_context.as_ref(), cancel).await
                }
                None => {
                    warn!(tool = %call.name, "unknown tool requested");
                    ToolResult::failure(format!("Unknown tool: {}", call.name))
                }
            };

            let mut stored_result = result.clone();
            if call.name == EMA_REPLY_TOOL_NAME && result.success {
                match parse_ema_reply(&result) {
                    Ok(reply) => {
                        info!("ema_reply received");
                        bus.emit(&AgentEvent::EmaReplyReceived { reply });
                        // The reply has already been delivered as an event;
                        // don't duplicate it in the stored tool message.
                        stored_result.content = None;
                    }
                    Err(e) => {
                        error!(error = %e, "ema_reply content failed validation");
                        stored_result = ToolResult::failure(e.to_string());
                    }
                }
            }

            state.messages.push(Message::Tool {
                id: None,
                name: call.name.clone(),
                result: stored_result,
            });
        }
    }

    bus.emit(&AgentEvent::RunFinished {
        ok: false,
        msg: format!("Task couldn't be completed after {max_steps} steps."),
        error: Some(EmaError::StepLimitExceeded { max_steps }.to_string()),
    });
}

fn emit_aborted(bus: &EventBus<AgentEvent>) {
    bus.emit(&AgentEvent::RunFinished { ok: false, msg: "Aborted".to_string(), error: None });
}
