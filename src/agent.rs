//! The agent orchestration core: a stateful `Agent` that owns the
//! conversation, pumps streaming turns from a provider, dispatches tool
//! calls, and supports mid-run steering and follow-ups.
//!
//! Turns execute strictly serially; there is never more than one active
//! provider stream per agent. Queued input is injected only at turn
//! boundaries. All failures surface as events; the loop never panics the
//! embedder.

use crate::bus::{EventBus, EventSubscriber};
use crate::context::{CompactionPolicy, Context, DefaultCompaction};
use crate::dispatch::{DispatchConfig, ToolDispatcher, BATCH_TOOL_NAME};
use crate::model::Model;
use crate::provider::{
    adapter, ProviderError, ProviderRegistry, StreamOptions, StreamRequest, ToolDefinition,
    TurnAssembler,
};
use crate::retry::{log_retry, RetryConfig};
use crate::session::SessionJournal;
use crate::types::{
    AgentEvent, AgentTool, ErrorKind, Message, StopReason, ThinkingLevel, Usage,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Shared services an agent is constructed against. Passed by reference so
/// tests and embedders control registration without global mutable state.
#[derive(Default)]
pub struct AgentRuntime {
    providers: ProviderRegistry,
}

impl AgentRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Streaming,
    DispatchingTools,
    Paused,
    Error,
}

/// Whether tool dispatch waits for an explicit `continue_run()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PausePolicy {
    /// Dispatch immediately after a `tool_use` stop (the default).
    #[default]
    AutoContinue,
    /// Pause before dispatching; `continue_run()` releases the turn.
    ConfirmTools,
}

// ---------------------------------------------------------------------------
// Options & builder
// ---------------------------------------------------------------------------

pub struct AgentOptions {
    pub system_prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub thinking: ThinkingLevel,
    pub retry: RetryConfig,
    pub dispatch: DispatchConfig,
    pub pause_policy: PausePolicy,
    /// Tokens held back from the context window before compaction triggers.
    pub reserve_tokens: usize,
    pub compaction: Option<Arc<dyn CompactionPolicy>>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            max_tokens: None,
            temperature: None,
            thinking: ThinkingLevel::Off,
            retry: RetryConfig::default(),
            dispatch: DispatchConfig::default(),
            pause_policy: PausePolicy::default(),
            reserve_tokens: 16_384,
            compaction: Some(Arc::new(DefaultCompaction)),
        }
    }
}

pub struct AgentBuilder {
    runtime: Arc<AgentRuntime>,
    model: Model,
    options: AgentOptions,
    tools: Vec<Arc<dyn AgentTool>>,
    journal: Option<SessionJournal>,
    messages: Vec<Message>,
    bus_capacity: usize,
    bus: Option<EventBus>,
}

impl AgentBuilder {
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.system_prompt = prompt.into();
        self
    }

    pub fn tools(mut self, tools: Vec<Arc<dyn AgentTool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn tool(mut self, tool: Arc<dyn AgentTool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Attach a journal. Unless `messages` is set explicitly the context is
    /// rebuilt from the journal's content.
    pub fn journal(mut self, journal: SessionJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.options.max_tokens = Some(max);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = Some(temperature);
        self
    }

    pub fn thinking(mut self, level: ThinkingLevel) -> Self {
        self.options.thinking = level;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.options.retry = retry;
        self
    }

    pub fn dispatch_config(mut self, dispatch: DispatchConfig) -> Self {
        self.options.dispatch = dispatch;
        self
    }

    pub fn pause_policy(mut self, policy: PausePolicy) -> Self {
        self.options.pause_policy = policy;
        self
    }

    pub fn reserve_tokens(mut self, reserve: usize) -> Self {
        self.options.reserve_tokens = reserve;
        self
    }

    pub fn compaction(mut self, policy: Arc<dyn CompactionPolicy>) -> Self {
        self.options.compaction = Some(policy);
        self
    }

    pub fn without_compaction(mut self) -> Self {
        self.options.compaction = None;
        self
    }

    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    /// Publish on an existing bus instead of a fresh one. Used by the
    /// subagent runtime so tools constructed before the agent can observe
    /// its events.
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Agent {
        let messages = if self.messages.is_empty() {
            match &self.journal {
                Some(journal) => journal.build_context().unwrap_or_else(|e| {
                    warn!(error = %e, "failed to rebuild context from journal");
                    Vec::new()
                }),
                None => Vec::new(),
            }
        } else {
            self.messages
        };

        let (state_tx, state_rx) = watch::channel(AgentState::Idle);
        Agent {
            inner: Arc::new(AgentInner {
                runtime: self.runtime,
                model: self.model,
                dispatcher: ToolDispatcher::new(self.tools, self.options.dispatch.clone()),
                options: self.options,
                bus: self.bus.unwrap_or_else(|| EventBus::new(self.bus_capacity)),
                context: Mutex::new(Context::from_messages(messages)),
                journal: Mutex::new(self.journal),
                usage: Mutex::new(Usage::default()),
                queue: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    running: false,
                }),
                state_tx,
                state_rx,
                resume: Notify::new(),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

struct QueueState {
    items: VecDeque<Message>,
    running: bool,
}

struct AgentInner {
    runtime: Arc<AgentRuntime>,
    model: Model,
    options: AgentOptions,
    dispatcher: ToolDispatcher,
    bus: EventBus,
    context: Mutex<Context>,
    journal: Mutex<Option<SessionJournal>>,
    usage: Mutex<Usage>,
    queue: Mutex<QueueState>,
    state_tx: watch::Sender<AgentState>,
    state_rx: watch::Receiver<AgentState>,
    resume: Notify,
    cancel: Mutex<CancellationToken>,
}

#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn builder(runtime: Arc<AgentRuntime>, model: Model) -> AgentBuilder {
        AgentBuilder {
            runtime,
            model,
            options: AgentOptions::default(),
            tools: Vec::new(),
            journal: None,
            messages: Vec::new(),
            bus_capacity: crate::bus::DEFAULT_CAPACITY,
            bus: None,
        }
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.inner.bus.subscribe()
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state_rx.borrow()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.inner
            .context
            .lock()
            .expect("context lock poisoned")
            .snapshot()
    }

    pub fn usage(&self) -> Usage {
        self.inner.usage.lock().expect("usage lock poisoned").clone()
    }

    pub fn model(&self) -> &Model {
        &self.inner.model
    }

    /// Append user input and start a run if idle; during a run, the input
    /// queues as a follow-up for the next turn boundary.
    pub fn prompt(&self, text: impl Into<String>) {
        self.prompt_messages(vec![Message::user(text)]);
    }

    pub fn prompt_messages(&self, messages: Vec<Message>) {
        self.enqueue(messages, true);
    }

    /// Inject a system-visible instruction at the next turn boundary. The
    /// system role is the steering hint that distinguishes it from
    /// follow-up user input. Never starts a run by itself.
    pub fn steer(&self, text: impl Into<String>) {
        self.enqueue(vec![Message::system(text)], false);
    }

    /// Queue additional user input for the next turn boundary. Never starts
    /// a run by itself.
    pub fn follow_up(&self, text: impl Into<String>) {
        self.enqueue(vec![Message::user(text)], false);
    }

    /// Release a paused dispatch. No-op under the auto-continue policy.
    pub fn continue_run(&self) {
        self.inner.resume.notify_one();
    }

    /// Request cooperative stop of the current run.
    pub fn cancel(&self) {
        self.inner
            .cancel
            .lock()
            .expect("cancel lock poisoned")
            .cancel();
    }

    /// Explicit client reset: the only transition out of `Error`.
    pub fn reset_error(&self) {
        if self.state() == AgentState::Error {
            let _ = self.inner.state_tx.send(AgentState::Idle);
            let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
            if !queue.items.is_empty() && !queue.running {
                queue.running = true;
                self.start_run();
            }
        }
    }

    /// Suspend until the state machine reaches `Idle`.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.inner.state_rx.clone();
        loop {
            if *rx.borrow() == AgentState::Idle {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Suspend until the run settles in `Idle` or `Error`.
    pub async fn wait_for_settled(&self) -> AgentState {
        let mut rx = self.inner.state_rx.clone();
        loop {
            let state = *rx.borrow();
            if state == AgentState::Idle || state == AgentState::Error {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    fn enqueue(&self, messages: Vec<Message>, start: bool) {
        let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
        queue.items.extend(messages);
        if start && !queue.running && self.state() != AgentState::Error {
            queue.running = true;
            self.start_run();
        }
    }

    fn start_run(&self) {
        // Fresh token per run so a cancelled run does not poison the next.
        let token = CancellationToken::new();
        *self.inner.cancel.lock().expect("cancel lock poisoned") = token;
        let _ = self.inner.state_tx.send(AgentState::Streaming);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run(inner).await;
        });
    }
}

// ---------------------------------------------------------------------------
// The turn pump
// ---------------------------------------------------------------------------

enum TurnFailure {
    Cancelled,
    /// Non-retryable failure: transition to `Error` until reset.
    Fatal { kind: ErrorKind, message: String },
    /// Terminal for the current turn only; the loop survives to `Idle`.
    Recoverable { kind: ErrorKind, message: String },
}

impl AgentInner {
    fn set_state(&self, state: AgentState) {
        let _ = self.state_tx.send(state);
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().expect("cancel lock poisoned").clone()
    }

    /// Append to the in-memory context and the journal in lockstep.
    fn append_message(&self, message: Message) -> Result<(), TurnFailure> {
        self.context
            .lock()
            .expect("context lock poisoned")
            .append(message.clone());
        if let Some(journal) = self
            .journal
            .lock()
            .expect("journal lock poisoned")
            .as_mut()
        {
            journal.append_message(&message).map_err(|e| {
                TurnFailure::Recoverable {
                    kind: ErrorKind::JournalIo,
                    message: e.to_string(),
                }
            })?;
        }
        Ok(())
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .dispatcher
            .tools()
            .iter()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
                label: Some(tool.label().to_string()),
            })
            .collect();
        if definitions.len() > 1 {
            definitions.push(ToolDefinition {
                name: BATCH_TOOL_NAME.to_string(),
                description: "Run several tool invocations as one group.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "invocations": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "name": { "type": "string" },
                                    "arguments": { "type": "object" }
                                },
                                "required": ["name", "arguments"]
                            }
                        }
                    },
                    "required": ["invocations"]
                }),
                label: Some("Batch".to_string()),
            });
        }
        definitions
    }
}

async fn run(inner: Arc<AgentInner>) {
    let cancel = inner.cancel_token();

    loop {
        // Step 1: drain queued input at the turn boundary, order preserved.
        let pending: Vec<Message> = {
            let mut queue = inner.queue.lock().expect("queue lock poisoned");
            queue.items.drain(..).collect()
        };
        for message in pending {
            if let Err(failure) = inner.append_message(message) {
                finish_failure(&inner, failure);
                return;
            }
        }

        // Between turns a cancellation just settles the loop.
        if cancel.is_cancelled() {
            finish_idle(&inner);
            return;
        }

        inner.set_state(AgentState::Streaming);
        inner.bus.publish(AgentEvent::TurnStarted);

        // Step 2: shrink the context if the estimate crowds the window.
        maybe_compact(&inner);

        // Steps 3-5: resolve provider, stream, finalise.
        let (message, turn_usage) = match stream_with_retry(&inner, &cancel).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                finish_failure(&inner, failure);
                return;
            }
        };

        if let Err(failure) = inner.append_message(message.clone()) {
            finish_failure(&inner, failure);
            return;
        }
        inner.bus.publish(AgentEvent::AssistantMessage {
            message: message.clone(),
        });

        // Usage accumulates at turn end, pointwise.
        let (usage, cost) = {
            let mut usage = inner.usage.lock().expect("usage lock poisoned");
            usage.add(&turn_usage);
            (usage.clone(), inner.model.cost.cost_of(&usage))
        };
        inner.bus.publish(AgentEvent::UsageUpdated { usage, cost });

        let stop_reason = match &message {
            Message::Assistant { stop_reason, .. } => *stop_reason,
            _ => StopReason::Stop,
        };
        let calls = message.tool_uses();

        // Step 6: dispatch tools and loop.
        if stop_reason == StopReason::ToolUse && !calls.is_empty() {
            inner.set_state(AgentState::DispatchingTools);

            if inner.options.pause_policy == PausePolicy::ConfirmTools {
                inner.set_state(AgentState::Paused);
                tokio::select! {
                    _ = inner.resume.notified() => {}
                    _ = cancel.cancelled() => {}
                }
                if cancel.is_cancelled() {
                    inner.bus.publish(AgentEvent::TurnEnded {
                        stop_reason: StopReason::Cancelled,
                    });
                    finish_idle(&inner);
                    return;
                }
                inner.set_state(AgentState::DispatchingTools);
            }

            let outcome = inner.dispatcher.dispatch(calls, &inner.bus, &cancel).await;
            let results = Message::tool_results(outcome.results);
            if let Err(failure) = inner.append_message(results) {
                finish_failure(&inner, failure);
                return;
            }

            if outcome.cancelled {
                inner.bus.publish(AgentEvent::TurnEnded {
                    stop_reason: StopReason::Cancelled,
                });
                finish_idle(&inner);
                return;
            }

            inner.bus.publish(AgentEvent::TurnEnded { stop_reason });
            continue;
        }

        // Step 7: turn over; loop again only for queued follow-ups. The
        // idle transition happens under the queue lock so a concurrent
        // prompt() cannot interleave between them.
        inner.bus.publish(AgentEvent::TurnEnded { stop_reason });

        let done = {
            let mut queue = inner.queue.lock().expect("queue lock poisoned");
            if queue.items.is_empty() {
                inner.set_state(AgentState::Idle);
                inner.bus.publish(AgentEvent::Idle);
                queue.running = false;
                true
            } else {
                false
            }
        };
        if done {
            return;
        }
    }
}

fn finish_idle(inner: &AgentInner) {
    let mut queue = inner.queue.lock().expect("queue lock poisoned");
    inner.set_state(AgentState::Idle);
    inner.bus.publish(AgentEvent::Idle);
    queue.running = false;
}

fn finish_failure(inner: &AgentInner, failure: TurnFailure) {
    match failure {
        TurnFailure::Cancelled => {
            inner.bus.publish(AgentEvent::TurnEnded {
                stop_reason: StopReason::Cancelled,
            });
            finish_idle(inner);
        }
        TurnFailure::Recoverable { kind, message } => {
            warn!(%kind, message = message.as_str(), "turn failed");
            inner.bus.publish(AgentEvent::Error { kind, message });
            inner.bus.publish(AgentEvent::TurnEnded {
                stop_reason: StopReason::Error,
            });
            finish_idle(inner);
        }
        TurnFailure::Fatal { kind, message } => {
            warn!(%kind, message = message.as_str(), "run failed");
            inner.bus.publish(AgentEvent::Error { kind, message });
            let mut queue = inner.queue.lock().expect("queue lock poisoned");
            inner.set_state(AgentState::Error);
            queue.running = false;
        }
    }
}

fn maybe_compact(inner: &AgentInner) {
    let Some(policy) = inner.options.compaction.as_ref() else {
        return;
    };
    let budget = (inner.model.context_window as usize)
        .saturating_sub(inner.options.reserve_tokens)
        .max(1);
    let mut context = inner.context.lock().expect("context lock poisoned");
    if context.token_estimate() > budget {
        context.compact(policy.as_ref(), budget);
    }
}

async fn stream_with_retry(
    inner: &AgentInner,
    cancel: &CancellationToken,
) -> Result<(Message, Usage), TurnFailure> {
    let provider = inner
        .runtime
        .providers()
        .get(&inner.model.api_id)
        .ok_or_else(|| TurnFailure::Fatal {
            kind: ErrorKind::ProviderNotFound,
            message: format!("no provider registered for api `{}`", inner.model.api_id),
        })?;

    let mut attempt = 0;
    loop {
        match stream_once(inner, provider.as_ref(), cancel).await {
            Ok(outcome) => return Ok(outcome),
            Err(ProviderError::Cancelled) => return Err(TurnFailure::Cancelled),
            Err(error) if error.is_retryable() && attempt < inner.options.retry.max_retries => {
                attempt += 1;
                let delay = inner.options.retry.delay_for_attempt(attempt);
                log_retry(attempt, inner.options.retry.max_retries, &delay, &error);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(TurnFailure::Cancelled),
                }
            }
            Err(error @ ProviderError::Transport { .. }) => {
                return Err(TurnFailure::Fatal {
                    kind: ErrorKind::ProviderTransport,
                    message: error.to_string(),
                })
            }
            Err(error) => {
                return Err(TurnFailure::Recoverable {
                    kind: ErrorKind::ProviderProtocol,
                    message: error.to_string(),
                })
            }
        }
    }
}

/// One provider round-trip: open the stream, translate events, assemble the
/// assistant message.
async fn stream_once(
    inner: &AgentInner,
    provider: &dyn crate::provider::Provider,
    cancel: &CancellationToken,
) -> Result<(Message, Usage), ProviderError> {
    let snapshot = inner
        .context
        .lock()
        .expect("context lock poisoned")
        .snapshot();
    let messages = if inner.model.reasoning {
        snapshot
    } else {
        adapter::flatten_thinking(snapshot)
    };

    debug!(
        model = inner.model.id.as_str(),
        messages = messages.len(),
        "opening provider stream"
    );

    let request = StreamRequest {
        model: inner.model.clone(),
        system_prompt: inner.options.system_prompt.clone(),
        tools: inner.tool_definitions(),
        options: StreamOptions {
            max_tokens: inner.options.max_tokens,
            temperature: inner.options.temperature,
            thinking: inner.options.thinking,
            cache_breakpoints: adapter::cache_breakpoints(messages.len()),
        },
        messages,
    };

    let mut stream = provider.stream(request, cancel.clone()).await?;
    let mut assembler = TurnAssembler::new(&inner.model.id, &inner.model.provider_id);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            event = stream.recv() => Some(event),
        };
        match next {
            // Cancelled: drain whatever the provider managed to emit, then
            // report; the run loop emits the synthetic TurnEnded.
            None => {
                while let Ok(event) = stream.try_recv() {
                    assembler.apply(event);
                }
                return Err(ProviderError::Cancelled);
            }
            Some(None) => break,
            Some(Some(event)) => {
                if let Some(delta) = assembler.apply(event) {
                    inner.bus.publish(AgentEvent::AssistantDelta {
                        partial: assembler.partial_message(),
                        delta,
                    });
                }
                if assembler.is_terminated() {
                    break;
                }
            }
        }
    }

    assembler.finish()
}
