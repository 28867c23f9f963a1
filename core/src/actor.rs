//! Actor Worker (spec §2 C6, §4.2): a per-`(user, agent, conversation)`
//! facade that serializes inputs, drives the agent run loop, publishes
//! events, and persists conversation messages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::agent;
use crate::context::AgentState;
use crate::error::{EmaError, EmaResult};
use crate::events::{ActorEvent, AgentEvent, EventBus, SubscriptionId};
use crate::llm::LlmClient;
use crate::model::{ActorKey, ActorStatus, BufferKind, BufferMessage, Content, Message};
use crate::store::{ConversationStore, LongTermMemoryStore, MemoryItem, ShortTermMemoryStore};
use crate::tool::{Tool, ToolContext};

/// Default conversation-buffer window size used for system-prompt
/// injection (spec §4.2.5, §9 — kept configurable, not hardcoded).
pub const DEFAULT_RECENT_WINDOW: usize = 10;

const MEMORY_BUFFER_TOKEN: &str = "{MEMORY_BUFFER}";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn to_user_message(buf: &BufferMessage) -> Message {
    Message::User { contents: buf.contents.clone(), name: buf.name.clone(), id: Some(buf.id.clone()) }
}

/// Everything an `ActorWorker` needs that lives outside the core (spec §6
/// external collaborators), gathered for constructor ergonomics.
pub struct ActorDeps {
    pub conversation_store: Arc<dyn ConversationStore>,
    pub long_term_memory: Arc<dyn LongTermMemoryStore>,
    pub short_term_memory: Arc<dyn ShortTermMemoryStore>,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub tool_context: Option<ToolContext>,
    pub system_prompt_template: String,
    pub max_steps: usize,
    pub recent_window: usize,
}

pub struct ActorWorker {
    key: ActorKey,
    status: Mutex<ActorStatus>,
    queue: Mutex<VecDeque<BufferMessage>>,
    agent_state: Mutex<Option<AgentState>>,
    resume_state_after_abort: AtomicBool,
    has_ema_reply_in_run: AtomicBool,
    current_cancel: Mutex<Option<CancellationToken>>,
    run_done: Notify,
    buffer_tx: mpsc::UnboundedSender<BufferMessage>,
    conversation_store: Arc<dyn ConversationStore>,
    long_term_memory: Arc<dyn LongTermMemoryStore>,
    short_term_memory: Arc<dyn ShortTermMemoryStore>,
    llm: Arc<dyn LlmClient>,
    tools: Vec<Arc<dyn Tool>>,
    tool_context: Option<ToolContext>,
    system_prompt_template: String,
    max_steps: usize,
    recent_window: usize,
    agent_events: EventBus<AgentEvent>,
    actor_events: EventBus<ActorEvent>,
}

impl ActorWorker {
    pub fn new(key: ActorKey, deps: ActorDeps) -> Arc<Self> {
        let buffer_tx = spawn_buffer_writer(key.conversation_id, deps.conversation_store.clone());

        let worker = Arc::new(Self {
            key,
            status: Mutex::new(ActorStatus::Idle),
            queue: Mutex::new(VecDeque::new()),
            agent_state: Mutex::new(None),
            resume_state_after_abort: AtomicBool::new(false),
            has_ema_reply_in_run: AtomicBool::new(false),
            current_cancel: Mutex::new(None),
            run_done: Notify::new(),
            buffer_tx,
            conversation_store: deps.conversation_store,
            long_term_memory: deps.long_term_memory,
            short_term_memory: deps.short_term_memory,
            llm: deps.llm,
            tools: deps.tools,
            tool_context: deps.tool_context,
            system_prompt_template: deps.system_prompt_template,
            max_steps: deps.max_steps,
            recent_window: if deps.recent_window == 0 { DEFAULT_RECENT_WINDOW } else { deps.recent_window },
            agent_events: EventBus::new(),
            actor_events: EventBus::new(),
        });

        worker.register_internal_forwarding();
        worker
    }

    pub fn key(&self) -> ActorKey {
        self.key
    }

    pub fn is_busy(&self) -> bool {
        *self.status.lock() != ActorStatus::Idle
    }

    pub fn status(&self) -> ActorStatus {
        *self.status.lock()
    }

    /// Subscribe to actor-level events (spec §4.2.4).
    pub fn on(&self, handler: impl Fn(&ActorEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.actor_events.on(handler)
    }

    pub fn off(&self, id: SubscriptionId) {
        self.actor_events.off(id);
    }

    pub async fn search(&self, keywords: Vec<String>) -> anyhow::Result<Vec<MemoryItem>> {
        self.long_term_memory.search(self.key.conversation_id, &keywords).await
    }

    pub async fn add_short_term_memory(&self, item: MemoryItem) -> anyhow::Result<()> {
        self.short_term_memory.add(self.key.conversation_id, item).await
    }

    pub async fn add_long_term_memory(&self, item: MemoryItem) -> anyhow::Result<()> {
        self.long_term_memory.add(self.key.conversation_id, item).await
    }

    /// Submit new user input (spec §4.2, operation `work`).
    #[tracing::instrument(skip_all, fields(actor = %self.key))]
    pub async fn work(self: &Arc<Self>, inputs: Vec<Content>) -> EmaResult<()> {
        if inputs.is_empty() {
            return Err(EmaError::validation("work() requires at least one content item"));
        }
        if let Some(bad) = inputs.iter().find(|c| !c.is_text()) {
            return Err(EmaError::validation(format!(
                "work() only accepts text content today, got {:?}",
                bad
            )));
        }

        let message = BufferMessage::new(BufferKind::User, inputs, now_ms());
        self.queue.lock().push_back(message.clone());
        self.enqueue_buffer_write(message);

        if self.try_claim_idle() {
            self.spawn_process_loop();
            return Ok(());
        }

        // Busy: abort the current run and wait for it to actually stop
        // before returning, per spec §4.2.2 step 1.
        let notified = self.run_done.notified();
        if let Some(token) = self.current_cancel.lock().clone() {
            token.cancel();
        }
        notified.await;
        Ok(())
    }

    fn try_claim_idle(&self) -> bool {
        let mut status = self.status.lock();
        if *status == ActorStatus::Idle {
            *status = ActorStatus::Preparing;
            true
        } else {
            false
        }
    }

    fn spawn_process_loop(self: &Arc<Self>) {
        let worker = self.clone();
        tokio::spawn(async move {
            worker.process_queue().await;
        });
    }

    /// Drains the queue while it is non-empty, running one agent run per
    /// batch (spec §4.2.2 step 2).
    async fn process_queue(self: Arc<Self>) {
        loop {
            let batches: Vec<BufferMessage> = {
                let mut queue = self.queue.lock();
                if queue.is_empty() {
                    break;
                }
                queue.drain(..).collect()
            };

            self.set_status_and_announce(ActorStatus::Preparing, "Actor status: preparing.");

            let resume = self.resume_state_after_abort.load(Ordering::SeqCst);
            let mut state = self.agent_state.lock().take();

            match (resume, &mut state) {
                (true, Some(existing)) => {
                    existing.extend_with_user_messages(batches.iter().map(to_user_message));
                }
                _ => {
                    let system_prompt = self.build_system_prompt().await;
                    let messages = batches.iter().map(to_user_message).collect();
                    state = Some(AgentState::new(
                        system_prompt,
                        messages,
                        self.tools.clone(),
                        self.tool_context.clone(),
                    ));
                }
            }
            let mut state = state.expect("agent state is always populated above");

            self.resume_state_after_abort.store(false, Ordering::SeqCst);
            self.has_ema_reply_in_run.store(false, Ordering::SeqCst);

            self.set_status_and_announce(ActorStatus::Running, "Actor status: running.");

            let cancel = CancellationToken::new();
            *self.current_cancel.lock() = Some(cancel.clone());

            agent::run(&mut state, self.llm.as_ref(), self.max_steps, &cancel, &self.agent_events).await;

            let was_aborted = cancel.is_cancelled();
            *self.current_cancel.lock() = None;
            self.run_done.notify_waiters();

            if was_aborted {
                let had_reply = self.has_ema_reply_in_run.load(Ordering::SeqCst);
                self.resume_state_after_abort.store(!had_reply, Ordering::SeqCst);
            }

            let resuming = self.resume_state_after_abort.load(Ordering::SeqCst);
            if resuming {
                *self.agent_state.lock() = Some(state);
            }

            if self.queue.lock().is_empty() && !resuming {
                self.set_status_and_announce(ActorStatus::Idle, "Actor status: idle.");
            }
        }
    }

    fn set_status_and_announce(&self, status: ActorStatus, message: &str) {
        *self.status.lock() = status;
        self.actor_events.emit(&ActorEvent::Message { content: message.to_string() });
    }

    fn enqueue_buffer_write(&self, message: BufferMessage) {
        if self.buffer_tx.send(message).is_err() {
            error!(actor = %self.key, "buffer write pipeline is gone, dropping write");
        }
    }

    /// Reads the most recent `recent_window` messages and substitutes
    /// `{MEMORY_BUFFER}` in the template (spec §4.2.5).
    async fn build_system_prompt(&self) -> String {
        if !self.system_prompt_template.contains(MEMORY_BUFFER_TOKEN) {
            return self.system_prompt_template.clone();
        }

        let recent = self
            .conversation_store
            .list_recent(self.key.conversation_id, self.recent_window)
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "failed to load recent conversation buffer for system prompt");
                Vec::new()
            });

        let rendered = if recent.is_empty() {
            "None.".to_string()
        } else {
            recent.iter().map(BufferMessage::render_line).collect::<Vec<_>>().join("\n")
        };

        self.system_prompt_template.replace(MEMORY_BUFFER_TOKEN, &rendered)
    }

    /// Wires the spec §4.2.4 forwarding rule: an `emaReplyReceived` event
    /// durably enqueues its reply before delivery to actor subscribers.
    fn register_internal_forwarding(self: &Arc<Self>) {
        let weak: Weak<ActorWorker> = Arc::downgrade(self);
        self.agent_events.on(move |event: &AgentEvent| {
            let Some(worker) = weak.upgrade() else { return };
            if let AgentEvent::EmaReplyReceived { reply } = event {
                worker.has_ema_reply_in_run.store(true, Ordering::SeqCst);
                worker.resume_state_after_abort.store(false, Ordering::SeqCst);
                let buffer_msg = BufferMessage::new(
                    BufferKind::Actor,
                    vec![Content::text(reply.response.clone())],
                    now_ms(),
                );
                worker.enqueue_buffer_write(buffer_msg);
                info!(actor = %worker.key, "ema reply enqueued for persistence before delivery");
            }
            worker.actor_events.emit(&ActorEvent::from_agent(event.clone()));
        });
    }
}

fn spawn_buffer_writer(
    conversation_id: i64,
    store: Arc<dyn ConversationStore>,
) -> mpsc::UnboundedSender<BufferMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel::<BufferMessage>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = store.append(conversation_id, message).await {
                error!(conversation_id, error = %e, "buffer write failed; continuing pipeline");
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, LlmResponse, ModelTurn};
    use crate::model::ToolCall;
    use crate::tool::{ToolContext as TC, EMA_REPLY_TOOL_NAME};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FakeConversationStore {
        messages: Mutex<Vec<BufferMessage>>,
    }

    impl FakeConversationStore {
        fn new() -> Arc<Self> {
            Arc::new(Self { messages: Mutex::new(Vec::new()) })
        }

        fn snapshot(&self) -> Vec<BufferMessage> {
            self.messages.lock().clone()
        }
    }

    #[async_trait]
    impl ConversationStore for FakeConversationStore {
        async fn append(&self, _conversation_id: i64, message: BufferMessage) -> anyhow::Result<()> {
            self.messages.lock().push(message);
            Ok(())
        }

        async fn list_recent(&self, _conversation_id: i64, limit: usize) -> anyhow::Result<Vec<BufferMessage>> {
            let all = self.messages.lock();
            let start = all.len().saturating_sub(limit);
            Ok(all[start..].to_vec())
        }
    }

    struct FakeLongTerm;
    #[async_trait]
    impl LongTermMemoryStore for FakeLongTerm {
        async fn search(&self, _conversation_id: i64, _keywords: &[String]) -> anyhow::Result<Vec<MemoryItem>> {
            Ok(vec![])
        }
        async fn add(&self, _conversation_id: i64, _item: MemoryItem) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FakeShortTerm;
    #[async_trait]
    impl ShortTermMemoryStore for FakeShortTerm {
        async fn add(&self, _conversation_id: i64, _item: MemoryItem) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct EmaReplyTool;
    #[async_trait]
    impl Tool for EmaReplyTool {
        fn name(&self) -> &str { EMA_REPLY_TOOL_NAME }
        fn description(&self) -> &str { "reply" }
        fn parameters(&self) -> serde_json::Value { serde_json::json!({}) }
        async fn execute(&self, _args: serde_json::Value, _ctx: Option<&TC>, _cancel: &CancellationToken) -> crate::model::ToolResult {
            crate::model::ToolResult::ok(r#"{"think":"t","expression":"普通","action":"无","response":"hi"}"#)
        }
    }

    /// Always returns a tool call to `ema_reply` on its first generate
    /// call and a finish thereafter; used for the Echo scenario.
    struct EchoLlm;
    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn generate(
            &self,
            _messages: &[Message],
            _tools: &[Arc<dyn Tool>],
            _system_prompt: &str,
            _cancel: &CancellationToken,
        ) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                message: ModelTurn {
                    text: String::new(),
                    tool_calls: vec![ToolCall { name: EMA_REPLY_TOOL_NAME.to_string(), args: serde_json::json!({}), thought_signature: None }],
                },
                finish_reason: "tool_calls".to_string(),
                total_tokens: None,
            })
        }
    }

    /// Blocks on a Notify until released, so tests can control exactly
    /// when a run is "mid-flight" to exercise abort/resume.
    struct BlockingLlm {
        release: Arc<Notify>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for BlockingLlm {
        async fn generate(
            &self,
            _messages: &[Message],
            _tools: &[Arc<dyn Tool>],
            _system_prompt: &str,
            cancel: &CancellationToken,
        ) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = cancel.cancelled() => Err(LlmError::Cancelled),
                _ = self.release.notified() => Ok(LlmResponse {
                    message: ModelTurn { text: "ack".to_string(), tool_calls: vec![] },
                    finish_reason: "stop".to_string(),
                    total_tokens: None,
                }),
            }
        }
    }

    fn deps(llm: Arc<dyn LlmClient>, tools: Vec<Arc<dyn Tool>>, store: Arc<dyn ConversationStore>) -> ActorDeps {
        ActorDeps {
            conversation_store: store,
            long_term_memory: Arc::new(FakeLongTerm),
            short_term_memory: Arc::new(FakeShortTerm),
            llm,
            tools,
            tool_context: None,
            system_prompt_template: "You are ema.".to_string(),
            max_steps: 10,
            recent_window: DEFAULT_RECENT_WINDOW,
        }
    }

    #[tokio::test]
    async fn echo_scenario_persists_user_then_actor_in_order() {
        let store = FakeConversationStore::new();
        let worker = ActorWorker::new(
            ActorKey::new(1, 1, 1),
            deps(Arc::new(EchoLlm), vec![Arc::new(EmaReplyTool)], store.clone()),
        );

        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        worker.on(move |event| r.lock().push(event.clone()));

        worker.work(vec![Content::text("hello")]).await.unwrap();

        // Give the spawned run loop + buffer writer a chance to settle.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let persisted = store.snapshot();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].kind, BufferKind::User);
        assert_eq!(persisted[1].kind, BufferKind::Actor);
        assert_eq!(persisted[1].contents[0].as_text(), Some("hi"));

        let events = received.lock();
        assert!(events.iter().any(|e| matches!(e, ActorEvent::Agent { content: AgentEvent::EmaReplyReceived { .. }, .. })));
        assert!(events.iter().any(|e| matches!(e, ActorEvent::Agent { content: AgentEvent::RunFinished { ok: true, .. }, .. })));
        assert!(!worker.is_busy());
    }

    #[tokio::test]
    async fn abort_before_reply_resumes_with_extended_history() {
        let store = FakeConversationStore::new();
        let release = Arc::new(Notify::new());
        let llm = Arc::new(BlockingLlm { release: release.clone(), calls: AtomicUsize::new(0) });
        let worker = ActorWorker::new(ActorKey::new(1, 1, 1), deps(llm, vec![], store));

        worker.work(vec![Content::text("first")]).await.unwrap();
        // Let the run actually start (status -> running) before aborting it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(worker.is_busy());

        // A second work() call arrives mid-run: must abort and return once
        // the current run has stopped (without ever releasing the LLM call).
        worker.work(vec![Content::text("second")]).await.unwrap();

        // The aborted run produced no reply, so the next run should see
        // both user messages folded into one AgentState.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(worker.is_busy());
        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!worker.is_busy());
    }
}
