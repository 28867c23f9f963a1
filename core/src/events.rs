//! Typed publish/subscribe event bus (spec §4, component C2).
//!
//! One listener list per event type, synchronous in-order fan-out to all
//! subscribers, no buffering beyond delivery. This replaces the
//! dynamic/string-keyed event maps a coroutine-flavored source would use
//! with the tagged-variant shape spec §9 calls for.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::ToolResult;

/// The reply payload carried by `AgentEvent::EmaReplyReceived`, parsed and
/// validated from the `ema_reply` tool's JSON content (spec §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaReply {
    pub think: String,
    pub expression: String,
    pub action: String,
    pub response: String,
}

/// Closed vocabulary for `expression`, matching spec §9's "expression ∈
/// {…}" note. Kept permissive-but-checked: unknown values are rejected at
/// the parse boundary in `crate::tool`, not hidden behind a catch-all enum
/// variant, so that "fail loudly on mismatch" is observable.
pub const VALID_EXPRESSIONS: &[&str] =
    &["普通", "开心", "难过", "生气", "惊讶", "害羞", "思考"];

/// Closed vocabulary for `action`.
pub const VALID_ACTIONS: &[&str] = &["无", "挥手", "点头", "摇头", "鼓掌", "指向"];

/// Events emitted by the agent run loop (spec §4.3).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    RunFinished { ok: bool, msg: String, error: Option<String> },
    EmaReplyReceived { reply: EmaReply },
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::RunFinished { .. } => "runFinished",
            AgentEvent::EmaReplyReceived { .. } => "emaReplyReceived",
        }
    }
}

/// Events published by an Actor Worker (spec §4.2.4).
#[derive(Debug, Clone)]
pub enum ActorEvent {
    Message { content: String },
    Agent { kind: &'static str, content: AgentEvent },
}

impl ActorEvent {
    pub fn from_agent(event: AgentEvent) -> Self {
        ActorEvent::Agent { kind: event.kind(), content: event }
    }
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A subscription id returned by `EventBus::on`, used to `off` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// A single-event-type publish/subscribe list.
///
/// Delivery is synchronous and in emission order. Per spec §5, a slow
/// subscriber must not block core progress; handlers registered here are
/// expected to be cheap (the actor worker's own subscribers just forward
/// onto an SSE channel or append to a buffer) — callers needing to do
/// expensive work from a handler should hand off to their own task.
pub struct EventBus<E> {
    next_id: Mutex<u64>,
    handlers: Mutex<Vec<(SubscriptionId, Handler<E>)>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self { next_id: Mutex::new(0), handlers: Mutex::new(Vec::new()) }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler, returning an id usable with `off`.
    pub fn on(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let mut next_id = self.next_id.lock();
        let id = SubscriptionId(*next_id);
        *next_id += 1;
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Unsubscribe a previously registered handler.
    pub fn off(&self, id: SubscriptionId) {
        self.handlers.lock().retain(|(hid, _)| *hid != id);
    }

    /// Deliver `event` to every current subscriber, in registration order.
    pub fn emit(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self.handlers.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

/// Parse and validate the `ema_reply` tool's successful JSON content into
/// an `EmaReply`. Fails loudly on malformed JSON or an out-of-vocabulary
/// `expression`/`action`, per spec §9.
pub fn parse_ema_reply(result: &ToolResult) -> Result<EmaReply, crate::error::EmaError> {
    let content = result
        .content
        .as_deref()
        .ok_or_else(|| crate::error::EmaError::validation("ema_reply tool result carried no content"))?;

    let reply: EmaReply = serde_json::from_str(content)
        .map_err(|e| crate::error::EmaError::validation(format!("ema_reply content is not valid JSON: {e}")))?;

    if !VALID_EXPRESSIONS.contains(&reply.expression.as_str()) {
        return Err(crate::error::EmaError::validation(format!(
            "ema_reply expression '{}' is not in the allowed vocabulary",
            reply.expression
        )));
    }
    if !VALID_ACTIONS.contains(&reply.action.as_str()) {
        return Err(crate::error::EmaError::validation(format!(
            "ema_reply action '{}' is not in the allowed vocabulary",
            reply.action
        )));
    }

    debug!(response = %reply.response, "parsed ema_reply");
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_to_all_subscribers_in_order() {
        let bus: EventBus<u32> = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.on(move |v| o1.lock().push((1, *v)));
        let o2 = order.clone();
        bus.on(move |v| o2.lock().push((2, *v)));

        bus.emit(&7);
        assert_eq!(*order.lock(), vec![(1, 7), (2, 7)]);
    }

    #[test]
    fn off_stops_delivery() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.on(move |_| { c.fetch_add(1, Ordering::SeqCst); });
        bus.emit(&1);
        bus.off(id);
        bus.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parses_valid_reply() {
        let result = ToolResult::ok(r#"{"think":"t","expression":"普通","action":"无","response":"hi"}"#);
        let reply = parse_ema_reply(&result).unwrap();
        assert_eq!(reply.response, "hi");
    }

    #[test]
    fn rejects_unknown_expression() {
        let result = ToolResult::ok(r#"{"think":"t","expression":"furious","action":"无","response":"hi"}"#);
        assert!(parse_ema_reply(&result).is_err());
    }
}
