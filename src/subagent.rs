//! Subagent runtime — the `task` tool delegates work to a nested agent.
//!
//! Subagents are declared in markdown files with YAML frontmatter (`name`,
//! `description`, `tools`, `spawns`, `model`, `thinking-level`); the body is
//! the subagent's system prompt. Each invocation gets an isolated context,
//! the definition's tool allow-list, and a by-value recursion-depth counter.
//! The subagent reports back through a single `submit_result` tool call;
//! its events re-publish on the parent bus tagged with the parent call id.

use crate::agent::{Agent, AgentRuntime, AgentState};
use crate::bus::EventBus;
use crate::model::Model;
use crate::types::{
    AgentEvent, AgentTool, ContentBlock, ErrorKind, Message, StreamDelta, ThinkingLevel,
    ToolError, ToolResult, ToolUpdateFn,
};
use serde::Deserialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_MAX_RECURSION_DEPTH: u32 = 3;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Which subagents a subagent may itself spawn.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SpawnsPolicy {
    /// May not delegate further (the default).
    #[default]
    None,
    /// May spawn any known subagent (`all` or `*`).
    All,
    /// May spawn only the named subagents.
    Allowed(Vec<String>),
}

impl SpawnsPolicy {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "none" => Self::None,
            "all" | "*" => Self::All,
            list => Self::Allowed(
                list.split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect(),
            ),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Allowed(names) => names.iter().any(|n| n == name),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid frontmatter: {0}")]
    InvalidFrontmatter(String),
    #[error("missing required frontmatter field: {0}")]
    MissingField(&'static str),
}

/// A parsed subagent definition. The markdown body becomes the subagent's
/// system prompt.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    /// Tool allow-list; `None` grants the whole pool.
    pub tools: Option<Vec<String>>,
    pub spawns: SpawnsPolicy,
    /// Substring patterns restricting which models may run this subagent.
    pub model_patterns: Vec<String>,
    pub thinking: ThinkingLevel,
    pub system_prompt: String,
}

impl AgentDefinition {
    pub fn model_allowed(&self, model_id: &str) -> bool {
        self.model_patterns.is_empty()
            || self
                .model_patterns
                .iter()
                .any(|pattern| model_id.contains(pattern.as_str()))
    }
}

#[derive(Debug, Deserialize)]
struct Frontmatter {
    name: Option<String>,
    description: Option<String>,
    tools: Option<Vec<String>>,
    spawns: Option<String>,
    model: Option<String>,
    #[serde(rename = "thinking-level")]
    thinking_level: Option<String>,
}

fn parse_thinking(raw: &str) -> Result<ThinkingLevel, DefinitionError> {
    match raw.trim() {
        "off" => Ok(ThinkingLevel::Off),
        "minimal" => Ok(ThinkingLevel::Minimal),
        "low" => Ok(ThinkingLevel::Low),
        "medium" => Ok(ThinkingLevel::Medium),
        "high" => Ok(ThinkingLevel::High),
        other => Err(DefinitionError::InvalidFrontmatter(format!(
            "unknown thinking-level `{}`",
            other
        ))),
    }
}

/// Parse a definition from markdown with a `---` fenced YAML frontmatter
/// block. `fallback_name` (usually the file stem) is used when the
/// frontmatter has no `name`.
pub fn parse_definition(
    source: &str,
    fallback_name: &str,
) -> Result<AgentDefinition, DefinitionError> {
    let trimmed = source.trim_start();
    let Some(after_open) = trimmed.strip_prefix("---") else {
        return Err(DefinitionError::InvalidFrontmatter(
            "missing opening ---".into(),
        ));
    };
    let end = after_open
        .find("\n---")
        .ok_or_else(|| DefinitionError::InvalidFrontmatter("missing closing ---".into()))?;
    let yaml_block = &after_open[..end];
    let body = after_open[end + 4..]
        .trim_start_matches(['-'])
        .trim_start_matches('\n');

    let frontmatter: Frontmatter = serde_yaml::from_str(yaml_block)
        .map_err(|e| DefinitionError::InvalidFrontmatter(e.to_string()))?;

    let description = frontmatter
        .description
        .ok_or(DefinitionError::MissingField("description"))?;

    Ok(AgentDefinition {
        name: frontmatter
            .name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| fallback_name.to_string()),
        description,
        tools: frontmatter.tools,
        spawns: frontmatter
            .spawns
            .as_deref()
            .map(SpawnsPolicy::parse)
            .unwrap_or_default(),
        model_patterns: frontmatter
            .model
            .map(|raw| {
                raw.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        thinking: frontmatter
            .thinking_level
            .as_deref()
            .map(parse_thinking)
            .transpose()?
            .unwrap_or_default(),
        system_prompt: body.trim().to_string(),
    })
}

pub fn load_definition(path: impl AsRef<Path>) -> Result<AgentDefinition, DefinitionError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|e| DefinitionError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let fallback = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    parse_definition(&source, &fallback)
}

// ---------------------------------------------------------------------------
// submit_result
// ---------------------------------------------------------------------------

/// Registered on every subagent: the call's arguments become the parent's
/// tool result.
struct SubmitResultTool {
    slot: Arc<Mutex<Option<serde_json::Value>>>,
}

#[async_trait::async_trait]
impl AgentTool for SubmitResultTool {
    fn name(&self) -> &str {
        "submit_result"
    }
    fn description(&self) -> &str {
        "Report the final result of your task. Call exactly once when done."
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "The final result to hand back to the requester"
                }
            },
            "required": ["result"]
        })
    }
    async fn execute(
        &self,
        _call_id: &str,
        args: serde_json::Value,
        _cancel: CancellationToken,
        _on_update: Option<ToolUpdateFn>,
    ) -> Result<ToolResult, ToolError> {
        *self.slot.lock().expect("result slot lock poisoned") = Some(args);
        Ok(ToolResult::text("Result recorded."))
    }
}

// ---------------------------------------------------------------------------
// task tool
// ---------------------------------------------------------------------------

/// The `task` tool: spawns a nested agent for a named subagent definition.
/// Always serial within a turn.
pub struct TaskTool {
    runtime: Arc<AgentRuntime>,
    model: Model,
    definitions: Vec<Arc<AgentDefinition>>,
    tool_pool: Vec<Arc<dyn AgentTool>>,
    parent_bus: EventBus,
    depth: u32,
    max_depth: u32,
    description: String,
}

impl TaskTool {
    pub fn new(runtime: Arc<AgentRuntime>, model: Model, parent_bus: EventBus) -> Self {
        Self {
            runtime,
            model,
            definitions: Vec::new(),
            tool_pool: Vec::new(),
            parent_bus,
            depth: 0,
            max_depth: DEFAULT_MAX_RECURSION_DEPTH,
            description: String::new(),
        }
    }

    pub fn with_definitions(mut self, definitions: Vec<AgentDefinition>) -> Self {
        self.definitions = definitions.into_iter().map(Arc::new).collect();
        self.description = self.describe();
        self
    }

    /// Tools subagents may draw on, filtered per definition allow-list.
    pub fn with_tool_pool(mut self, tools: Vec<Arc<dyn AgentTool>>) -> Self {
        self.tool_pool = tools;
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn describe(&self) -> String {
        let mut text = String::from(
            "Delegate a task to a specialised subagent. Available subagents:\n",
        );
        for definition in &self.definitions {
            text.push_str(&format!("- {}: {}\n", definition.name, definition.description));
        }
        text
    }

    fn find(&self, name: &str) -> Option<Arc<AgentDefinition>> {
        self.definitions.iter().find(|d| d.name == name).cloned()
    }

    fn allowed_tools(&self, definition: &AgentDefinition) -> Vec<Arc<dyn AgentTool>> {
        match &definition.tools {
            None => self.tool_pool.clone(),
            Some(names) => self
                .tool_pool
                .iter()
                .filter(|tool| names.iter().any(|n| n == tool.name()))
                .cloned()
                .collect(),
        }
    }

    /// The nested `task` tool a spawning subagent receives: one level
    /// deeper, definitions narrowed by the spawns policy.
    fn nested(&self, definition: &AgentDefinition) -> TaskTool {
        let definitions = self
            .definitions
            .iter()
            .filter(|d| definition.spawns.allows(&d.name))
            .cloned()
            .collect();
        let mut nested = TaskTool {
            runtime: Arc::clone(&self.runtime),
            model: self.model.clone(),
            definitions,
            tool_pool: self.tool_pool.clone(),
            parent_bus: self.parent_bus.clone(),
            depth: self.depth + 1,
            max_depth: self.max_depth,
            description: String::new(),
        };
        nested.description = nested.describe();
        nested
    }
}

#[async_trait::async_trait]
impl AgentTool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }
    fn label(&self) -> &str {
        "Delegate Task"
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "description": "Name of the subagent to delegate to"
                },
                "task": {
                    "type": "string",
                    "description": "What the subagent should do"
                }
            },
            "required": ["agent", "task"]
        })
    }
    fn serial(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        call_id: &str,
        args: serde_json::Value,
        cancel: CancellationToken,
        on_update: Option<ToolUpdateFn>,
    ) -> Result<ToolResult, ToolError> {
        let agent_name = args["agent"].as_str().unwrap_or_default().to_string();
        let task = args["task"].as_str().unwrap_or_default().to_string();

        if self.depth >= self.max_depth {
            self.parent_bus.publish(AgentEvent::Error {
                kind: ErrorKind::SubagentDepthExceeded,
                message: format!("subagent recursion depth {} exceeded", self.max_depth),
            });
            return Err(ToolError::Failed(format!(
                "Subagent recursion depth exceeded ({})",
                self.max_depth
            )));
        }

        let definition = self
            .find(&agent_name)
            .ok_or_else(|| ToolError::Failed(format!("Unknown subagent: {}", agent_name)))?;

        if !definition.model_allowed(&self.model.id) {
            warn!(
                subagent = definition.name.as_str(),
                model = self.model.id.as_str(),
                "model does not match the subagent's model patterns"
            );
        }

        debug!(
            subagent = definition.name.as_str(),
            depth = self.depth,
            "spawning subagent"
        );

        let mut tools = self.allowed_tools(&definition);
        if definition.spawns != SpawnsPolicy::None {
            tools.push(Arc::new(self.nested(&definition)));
        }
        let result_slot: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
        tools.push(Arc::new(SubmitResultTool {
            slot: Arc::clone(&result_slot),
        }));

        let child_bus = EventBus::default();
        let agent = Agent::builder(Arc::clone(&self.runtime), self.model.clone())
            .system_prompt(definition.system_prompt.clone())
            .thinking(definition.thinking)
            .tools(tools)
            .bus(child_bus.clone())
            .build();

        // Re-publish child events on the parent bus, tagged; stream text
        // progress to the parent tool call as it arrives.
        let mut child_events = child_bus.subscribe();
        let parent_bus = self.parent_bus.clone();
        let parent_call_id = call_id.to_string();
        let forward = tokio::spawn(async move {
            while let Some(event) = child_events.recv().await {
                if let (Some(on_update), AgentEvent::AssistantDelta {
                    delta: StreamDelta::Text { delta },
                    ..
                }) = (&on_update, &event)
                {
                    on_update(ToolResult::text(delta.clone()));
                }
                parent_bus.publish(AgentEvent::Subagent {
                    parent_call_id: parent_call_id.clone(),
                    event: Box::new(event),
                });
            }
        });

        agent.prompt(task);
        let settled = tokio::select! {
            state = agent.wait_for_settled() => state,
            _ = cancel.cancelled() => {
                agent.cancel();
                agent.wait_for_settled().await
            }
        };

        let submitted = result_slot
            .lock()
            .expect("result slot lock poisoned")
            .take();
        let transcript = agent.snapshot();
        // Drop every sender so the forwarding task drains and exits.
        drop(agent);
        drop(child_bus);
        let _ = forward.await;

        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        if settled == AgentState::Error {
            return Err(ToolError::Failed(format!(
                "Subagent '{}' failed before completing its task",
                definition.name
            )));
        }

        let (text, details) = match submitted {
            Some(value) => {
                let text = value["result"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                (text, value)
            }
            None => (
                final_assistant_text(&transcript),
                serde_json::Value::Null,
            ),
        };

        Ok(ToolResult {
            content: vec![ContentBlock::text(text)],
            details: serde_json::json!({
                "subagent": definition.name,
                "messages": transcript.len(),
                "submitted": details,
            }),
        })
    }
}

/// Fallback when the subagent never called `submit_result`: the text of its
/// last assistant message.
fn final_assistant_text(messages: &[Message]) -> String {
    for message in messages.iter().rev() {
        if let Message::Assistant { content, .. } = message {
            let texts: Vec<&str> = content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            if !texts.is_empty() {
                return texts.join("\n");
            }
        }
    }
    "(subagent produced no output)".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESEARCHER: &str = "---\nname: researcher\ndescription: Digs through code\ntools:\n  - read_file\nspawns: none\nmodel: sonnet, haiku\nthinking-level: low\n---\n\nYou are a careful researcher.\n";

    #[test]
    fn frontmatter_parses_all_keys() {
        let definition = parse_definition(RESEARCHER, "fallback").unwrap();
        assert_eq!(definition.name, "researcher");
        assert_eq!(definition.description, "Digs through code");
        assert_eq!(definition.tools, Some(vec!["read_file".to_string()]));
        assert_eq!(definition.spawns, SpawnsPolicy::None);
        assert_eq!(definition.model_patterns, vec!["sonnet", "haiku"]);
        assert_eq!(definition.thinking, ThinkingLevel::Low);
        assert_eq!(definition.system_prompt, "You are a careful researcher.");
    }

    #[test]
    fn name_falls_back_to_file_stem() {
        let source = "---\ndescription: No name given\n---\nBody.";
        let definition = parse_definition(source, "my-agent").unwrap();
        assert_eq!(definition.name, "my-agent");
    }

    #[test]
    fn missing_description_is_rejected() {
        let source = "---\nname: x\n---\nBody.";
        assert!(matches!(
            parse_definition(source, "x"),
            Err(DefinitionError::MissingField("description"))
        ));
    }

    #[test]
    fn spawns_policy_grammar() {
        assert_eq!(SpawnsPolicy::parse("none"), SpawnsPolicy::None);
        assert_eq!(SpawnsPolicy::parse("all"), SpawnsPolicy::All);
        assert_eq!(SpawnsPolicy::parse("*"), SpawnsPolicy::All);
        assert_eq!(
            SpawnsPolicy::parse("researcher, writer"),
            SpawnsPolicy::Allowed(vec!["researcher".into(), "writer".into()])
        );
        assert!(SpawnsPolicy::All.allows("anything"));
        assert!(!SpawnsPolicy::None.allows("anything"));
        assert!(SpawnsPolicy::parse("a,b").allows("b"));
    }

    #[test]
    fn model_patterns_are_substring_matches() {
        let definition = parse_definition(RESEARCHER, "r").unwrap();
        assert!(definition.model_allowed("claude-sonnet-4"));
        assert!(!definition.model_allowed("gpt-4o"));
        let unrestricted = parse_definition("---\ndescription: d\n---\n", "u").unwrap();
        assert!(unrestricted.model_allowed("anything"));
    }
}
