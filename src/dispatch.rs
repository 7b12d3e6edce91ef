//! Tool dispatcher — validates, schedules, and aggregates the tool calls of
//! one assistant turn.
//!
//! Scheduling: calls run concurrently up to the parallelism bound. A call
//! whose tool declares `serial()` runs strictly after all preceding calls
//! complete. Same-tool calls serialise through a per-tool lock unless the
//! tool declares `reentrant()`. Results are re-assembled in the order of the
//! original `ToolUse` blocks regardless of completion order.

use crate::bus::EventBus;
#[cfg(not(test))]
use crate::types::{AgentEvent, AgentTool, ContentBlock, ToolCall, ToolUpdateFn};
#[cfg(test)]
use crate::types::{AgentEvent, AgentTool, ContentBlock, ToolCall, ToolError, ToolUpdateFn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reserved tool name whose arguments wrap a group of nested calls.
pub const BATCH_TOOL_NAME: &str = "batch";

pub const DEFAULT_PARALLELISM: usize = 8;
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Concurrency bound for calls within a single turn.
    pub parallelism: usize,
    /// How long cancelled tools get to stop cooperatively.
    pub cancel_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            cancel_grace: DEFAULT_GRACE,
        }
    }
}

pub struct DispatchOutcome {
    /// One `ContentBlock::ToolResult` per `ToolUse`, in `ToolUse` order.
    pub results: Vec<ContentBlock>,
    pub cancelled: bool,
}

pub struct ToolDispatcher {
    tools: Vec<Arc<dyn AgentTool>>,
    config: DispatchConfig,
}

fn error_block(call_id: &str, message: impl Into<String>) -> ContentBlock {
    ContentBlock::ToolResult {
        tool_use_id: call_id.to_string(),
        content: vec![ContentBlock::text(message)],
        is_error: true,
    }
}

/// Validate parsed arguments against a tool's JSON Schema (draft 2020-12).
fn validate_args(schema: &serde_json::Value, args: &serde_json::Value) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| format!("tool declares an invalid schema: {}", e))?;
    let messages: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(messages.join("; "))
    }
}

fn batch_schema() -> serde_json::Value {
    serde_json::json!({
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
    })
}

enum Planned {
    /// Resolved without execution: validation failure, duplicate id,
    /// unknown tool.
    Immediate(ContentBlock),
    Run {
        tool: Arc<dyn AgentTool>,
        call: ToolCall,
    },
    Batch {
        calls: Vec<(Arc<dyn AgentTool>, ToolCall)>,
        parent: ToolCall,
        /// Pre-resolved errors for invalid nested invocations, by position.
        nested_errors: Vec<(usize, String)>,
    },
}

impl ToolDispatcher {
    pub fn new(tools: Vec<Arc<dyn AgentTool>>, config: DispatchConfig) -> Self {
        Self { tools, config }
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn tools(&self) -> &[Arc<dyn AgentTool>] {
        &self.tools
    }

    /// Execute the turn's tool calls and assemble results in call order.
    pub async fn dispatch(
        &self,
        calls: Vec<ToolCall>,
        bus: &EventBus,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let mut results: Vec<Option<ContentBlock>> = (0..calls.len()).map(|_| None).collect();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut plan: Vec<(usize, Planned)> = Vec::new();

        for (index, call) in calls.into_iter().enumerate() {
            let planned = self.plan_call(call, &mut seen_ids);
            plan.push((index, planned));
        }

        // Same-tool calls share a lock unless the tool is re-entrant.
        let mut tool_locks: HashMap<String, Arc<Mutex<()>>> = HashMap::new();
        for (_, planned) in &plan {
            if let Planned::Run { tool, .. } = planned {
                if !tool.reentrant() {
                    tool_locks
                        .entry(tool.name().to_string())
                        .or_insert_with(|| Arc::new(Mutex::new(())));
                }
            }
        }

        // Waves: a serial call forms its own wave and acts as a barrier;
        // consecutive concurrent calls share a wave.
        let mut waves: Vec<Vec<(usize, Planned)>> = Vec::new();
        let mut last_wave_serial = false;
        for (index, planned) in plan {
            if let Planned::Immediate(block) = planned {
                self.emit_immediate(bus, &block);
                results[index] = Some(block);
                continue;
            }
            let serial = match &planned {
                Planned::Run { tool, .. } => tool.serial(),
                // A batch may contain serial tools; run it as its own wave.
                Planned::Batch { .. } => true,
                Planned::Immediate(_) => false,
            };
            if serial {
                waves.push(vec![(index, planned)]);
            } else {
                match waves.last_mut() {
                    Some(wave) if !last_wave_serial => wave.push((index, planned)),
                    _ => waves.push(vec![(index, planned)]),
                }
            }
            last_wave_serial = serial;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut interrupted = false;

        for wave in waves {
            if cancel.is_cancelled() {
                interrupted = true;
            }
            if interrupted {
                for (index, planned) in wave {
                    let call_id = Self::planned_call_id(&planned);
                    results[index] = Some(error_block(&call_id, "Cancelled"));
                }
                continue;
            }

            let mut handles: Vec<(usize, String, JoinHandle<ContentBlock>)> = Vec::new();
            for (index, planned) in wave {
                let call_id = Self::planned_call_id(&planned);
                let handle = self.spawn_call(
                    planned,
                    bus.clone(),
                    Arc::clone(&semaphore),
                    &tool_locks,
                    cancel.child_token(),
                );
                handles.push((index, call_id, handle));
            }

            for (index, call_id, mut handle) in handles {
                let joined = tokio::select! {
                    joined = &mut handle => Some(joined),
                    _ = cancel.cancelled() => None,
                };
                let block = match joined {
                    Some(joined) => Self::unwrap_join(joined, &call_id),
                    // Cancelled mid-flight: grace period for cooperative stop.
                    None => match tokio::time::timeout(self.config.cancel_grace, &mut handle).await
                    {
                        Ok(joined) => Self::unwrap_join(joined, &call_id),
                        Err(_) => {
                            warn!(
                                call_id = call_id.as_str(),
                                "tool did not stop within the grace period"
                            );
                            handle.abort();
                            error_block(&call_id, "Cancelled: tool did not stop in time")
                        }
                    },
                };
                results[index] = Some(block);
            }
        }

        DispatchOutcome {
            results: results
                .into_iter()
                .map(|slot| slot.unwrap_or_else(|| error_block("unknown", "Internal: missing result")))
                .collect(),
            cancelled: cancel.is_cancelled() || interrupted,
        }
    }

    fn planned_call_id(planned: &Planned) -> String {
        match planned {
            Planned::Immediate(ContentBlock::ToolResult { tool_use_id, .. }) => {
                tool_use_id.clone()
            }
            Planned::Immediate(_) => "unknown".to_string(),
            Planned::Run { call, .. } => call.id.clone(),
            Planned::Batch { parent, .. } => parent.id.clone(),
        }
    }

    fn plan_call(&self, call: ToolCall, seen_ids: &mut HashSet<String>) -> Planned {
        // At-most-once per turn: a replayed call_id is refused.
        if !seen_ids.insert(call.id.clone()) {
            warn!(call_id = call.id.as_str(), "duplicate tool call id refused");
            return Planned::Immediate(error_block(
                &call.id,
                format!("Duplicate tool call id: {}", call.id),
            ));
        }

        if call.name == BATCH_TOOL_NAME {
            return self.plan_batch(call);
        }

        let tool = match self.find(&call.name) {
            Some(tool) => tool,
            None => {
                return Planned::Immediate(error_block(
                    &call.id,
                    format!("Tool not found: {}", call.name),
                ))
            }
        };

        if let Err(detail) = validate_args(&tool.parameters_schema(), &call.arguments) {
            return Planned::Immediate(error_block(
                &call.id,
                format!("Invalid arguments: {}", detail),
            ));
        }

        Planned::Run { tool, call }
    }

    fn plan_batch(&self, parent: ToolCall) -> Planned {
        if let Err(detail) = validate_args(&batch_schema(), &parent.arguments) {
            return Planned::Immediate(error_block(
                &parent.id,
                format!("Invalid arguments: {}", detail),
            ));
        }

        let invocations = parent.arguments["invocations"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut calls = Vec::new();
        let mut nested_errors = Vec::new();
        for (position, invocation) in invocations.iter().enumerate() {
            let name = invocation["name"].as_str().unwrap_or_default().to_string();
            let arguments = invocation["arguments"].clone();
            if name == BATCH_TOOL_NAME {
                nested_errors.push((position, "batch calls cannot nest".to_string()));
                continue;
            }
            let Some(tool) = self.find(&name) else {
                nested_errors.push((position, format!("Tool not found: {}", name)));
                continue;
            };
            if let Err(detail) = validate_args(&tool.parameters_schema(), &arguments) {
                nested_errors.push((position, format!("Invalid arguments: {}", detail)));
                continue;
            }
            calls.push((
                tool,
                ToolCall {
                    id: format!("{}#{}", parent.id, position),
                    name,
                    arguments,
                },
            ));
        }

        Planned::Batch {
            calls,
            parent,
            nested_errors,
        }
    }

    fn emit_immediate(&self, bus: &EventBus, block: &ContentBlock) {
        if let ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } = block
        {
            bus.publish(AgentEvent::ToolCallFinished {
                call_id: tool_use_id.clone(),
                content: content.clone(),
                is_error: *is_error,
            });
        }
    }

    fn spawn_call(
        &self,
        planned: Planned,
        bus: EventBus,
        semaphore: Arc<Semaphore>,
        tool_locks: &HashMap<String, Arc<Mutex<()>>>,
        cancel: CancellationToken,
    ) -> JoinHandle<ContentBlock> {
        match planned {
            Planned::Immediate(block) => tokio::spawn(async move { block }),
            Planned::Run { tool, call } => {
                let lock = tool_locks.get(tool.name()).cloned();
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let _guard = match &lock {
                        Some(lock) => Some(lock.lock().await),
                        None => None,
                    };
                    execute_one(tool, call, &bus, cancel).await
                })
            }
            Planned::Batch {
                calls,
                parent,
                nested_errors,
            } => tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                execute_batch(calls, parent, nested_errors, &bus, cancel).await
            }),
        }
    }

    fn unwrap_join(
        joined: Result<ContentBlock, tokio::task::JoinError>,
        call_id: &str,
    ) -> ContentBlock {
        match joined {
            Ok(block) => block,
            Err(e) if e.is_panic() => {
                warn!(call_id = call_id, "tool panicked");
                error_block(call_id, "Tool crashed while executing")
            }
            Err(_) => error_block(call_id, "Cancelled"),
        }
    }
}

/// Run a single validated call, publishing lifecycle events.
async fn execute_one(
    tool: Arc<dyn AgentTool>,
    call: ToolCall,
    bus: &EventBus,
    cancel: CancellationToken,
) -> ContentBlock {
    debug!(call_id = call.id.as_str(), tool = call.name.as_str(), "tool call started");
    bus.publish(AgentEvent::ToolCallStarted {
        call_id: call.id.clone(),
        name: call.name.clone(),
        label: tool.label().to_string(),
    });

    let update_bus = bus.clone();
    let update_id = call.id.clone();
    let on_update: ToolUpdateFn = Arc::new(move |progress| {
        update_bus.publish(AgentEvent::ToolCallUpdate {
            call_id: update_id.clone(),
            progress,
        });
    });

    let (content, is_error) = match tool
        .execute(&call.id, call.arguments.clone(), cancel, Some(on_update))
        .await
    {
        Ok(result) => (result.content, false),
        Err(e) => (vec![ContentBlock::text(e.to_string())], true),
    };

    bus.publish(AgentEvent::ToolCallFinished {
        call_id: call.id.clone(),
        content: content.clone(),
        is_error,
    });

    ContentBlock::ToolResult {
        tool_use_id: call.id,
        content,
        is_error,
    }
}

/// Run a batch group. Nested invocations execute sequentially in argument
/// order; the parent call produces one aggregated result block.
async fn execute_batch(
    calls: Vec<(Arc<dyn AgentTool>, ToolCall)>,
    parent: ToolCall,
    nested_errors: Vec<(usize, String)>,
    bus: &EventBus,
    cancel: CancellationToken,
) -> ContentBlock {
    bus.publish(AgentEvent::ToolCallStarted {
        call_id: parent.id.clone(),
        name: BATCH_TOOL_NAME.to_string(),
        label: BATCH_TOOL_NAME.to_string(),
    });

    let mut content: Vec<ContentBlock> = Vec::new();
    let mut is_error = false;

    for (_, detail) in &nested_errors {
        content.push(ContentBlock::text(detail.clone()));
        is_error = true;
    }

    for (tool, call) in calls {
        if cancel.is_cancelled() {
            content.push(ContentBlock::text("Cancelled"));
            is_error = true;
            break;
        }
        let block = execute_one(tool, call, bus, cancel.child_token()).await;
        if let ContentBlock::ToolResult {
            content: nested,
            is_error: nested_error,
            ..
        } = block
        {
            content.extend(nested);
            is_error = is_error || nested_error;
        }
    }

    bus.publish(AgentEvent::ToolCallFinished {
        call_id: parent.id.clone(),
        content: content.clone(),
        is_error,
    });

    ContentBlock::ToolResult {
        tool_use_id: parent.id,
        content,
        is_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolResult, ToolUpdateFn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool {
        serial: bool,
        reentrant: bool,
        executions: Arc<AtomicUsize>,
    }

    impl EchoTool {
        fn new() -> Self {
            Self {
                serial: false,
                reentrant: true,
                executions: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait::async_trait]
    impl AgentTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        fn serial(&self) -> bool {
            self.serial
        }
        fn reentrant(&self) -> bool {
            self.reentrant
        }
        async fn execute(
            &self,
            _call_id: &str,
            args: serde_json::Value,
            _cancel: CancellationToken,
            _on_update: Option<ToolUpdateFn>,
        ) -> Result<ToolResult, ToolError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResult::text(
                args["text"].as_str().unwrap_or_default().to_string(),
            ))
        }
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_execute() {
        let tool = EchoTool::new();
        let executions = Arc::clone(&tool.executions);
        let dispatcher = ToolDispatcher::new(vec![Arc::new(tool)], DispatchConfig::default());
        let bus = EventBus::default();

        let outcome = dispatcher
            .dispatch(
                vec![call("c1", "echo", serde_json::json!({}))],
                &bus,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(executions.load(Ordering::SeqCst), 0);
        match &outcome.results[0] {
            ContentBlock::ToolResult {
                content, is_error, ..
            } => {
                assert!(is_error);
                match &content[0] {
                    ContentBlock::Text { text } => assert!(text.contains("Invalid arguments")),
                    other => panic!("unexpected block {:?}", other),
                }
            }
            other => panic!("unexpected block {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_call_ids_execute_once() {
        let tool = EchoTool::new();
        let executions = Arc::clone(&tool.executions);
        let dispatcher = ToolDispatcher::new(vec![Arc::new(tool)], DispatchConfig::default());
        let bus = EventBus::default();

        let outcome = dispatcher
            .dispatch(
                vec![
                    call("dup", "echo", serde_json::json!({"text": "a"})),
                    call("dup", "echo", serde_json::json!({"text": "b"})),
                ],
                &bus,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(matches!(
            &outcome.results[1],
            ContentBlock::ToolResult { is_error: true, .. }
        ));
    }

    #[tokio::test]
    async fn results_keep_tool_use_order() {
        struct SlowFirst;
        #[async_trait::async_trait]
        impl AgentTool for SlowFirst {
            fn name(&self) -> &str {
                "slow"
            }
            fn description(&self) -> &str {
                "sleeps then answers"
            }
            fn parameters_schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "object"})
            }
            fn reentrant(&self) -> bool {
                true
            }
            async fn execute(
                &self,
                call_id: &str,
                _args: serde_json::Value,
                _cancel: CancellationToken,
                _on_update: Option<ToolUpdateFn>,
            ) -> Result<ToolResult, ToolError> {
                if call_id == "c1" {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok(ToolResult::text(call_id.to_string()))
            }
        }

        let dispatcher = ToolDispatcher::new(vec![Arc::new(SlowFirst)], DispatchConfig::default());
        let bus = EventBus::default();

        let outcome = dispatcher
            .dispatch(
                vec![
                    call("c1", "slow", serde_json::json!({})),
                    call("c2", "slow", serde_json::json!({})),
                    call("c3", "slow", serde_json::json!({})),
                ],
                &bus,
                &CancellationToken::new(),
            )
            .await;

        let ids: Vec<&str> = outcome
            .results
            .iter()
            .map(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => tool_use_id.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn batch_unwraps_and_aggregates() {
        let tool = EchoTool::new();
        let executions = Arc::clone(&tool.executions);
        let dispatcher = ToolDispatcher::new(vec![Arc::new(tool)], DispatchConfig::default());
        let bus = EventBus::default();

        let outcome = dispatcher
            .dispatch(
                vec![call(
                    "b1",
                    "batch",
                    serde_json::json!({
                        "invocations": [
                            { "name": "echo", "arguments": { "text": "one" } },
                            { "name": "echo", "arguments": { "text": "two" } },
                            { "name": "echo", "arguments": {} }
                        ]
                    }),
                )],
                &bus,
                &CancellationToken::new(),
            )
            .await;

        // Two valid invocations executed; the invalid one was refused.
        assert_eq!(executions.load(Ordering::SeqCst), 2);
        match &outcome.results[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "b1");
                assert!(is_error);
                assert_eq!(content.len(), 3);
            }
            other => panic!("unexpected block {:?}", other),
        }
    }
}
