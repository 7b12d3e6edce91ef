use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Content blocks
// ---------------------------------------------------------------------------

/// How image bytes reach the provider: inline base64 or a fetchable URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSource {
    Data { data: String },
    Url { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        #[serde(flatten)]
        source: ImageSource,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "toolUse")]
    ToolUse {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    #[serde(rename = "toolResult")]
    ToolResult {
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        content: Vec<ContentBlock>,
        #[serde(rename = "isError")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A conversation message. Context order is the source of truth for
/// conversational order; `timestamp` is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "user")]
    User {
        id: String,
        content: Vec<ContentBlock>,
        timestamp: u64,
    },
    #[serde(rename = "assistant")]
    Assistant {
        id: String,
        content: Vec<ContentBlock>,
        #[serde(rename = "stopReason")]
        stop_reason: StopReason,
        model: String,
        provider: String,
        usage: Usage,
        timestamp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    #[serde(rename = "toolResult")]
    ToolResult {
        id: String,
        content: Vec<ContentBlock>,
        timestamp: u64,
    },
    #[serde(rename = "system")]
    System {
        id: String,
        content: Vec<ContentBlock>,
        timestamp: u64,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            id: new_id(),
            content: vec![ContentBlock::text(text)],
            timestamp: now_ms(),
        }
    }

    pub fn user_blocks(content: Vec<ContentBlock>) -> Self {
        Self::User {
            id: new_id(),
            content,
            timestamp: now_ms(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            id: new_id(),
            content: vec![ContentBlock::text(text)],
            timestamp: now_ms(),
        }
    }

    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self::ToolResult {
            id: new_id(),
            content: results,
            timestamp: now_ms(),
        }
    }

    pub fn role(&self) -> &str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "toolResult",
            Self::System { .. } => "system",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User { id, .. }
            | Self::Assistant { id, .. }
            | Self::ToolResult { id, .. }
            | Self::System { id, .. } => id,
        }
    }

    pub fn content(&self) -> &[ContentBlock] {
        match self {
            Self::User { content, .. }
            | Self::Assistant { content, .. }
            | Self::ToolResult { content, .. }
            | Self::System { content, .. } => content,
        }
    }

    /// Tool calls requested by this message, in emission order.
    pub fn tool_uses(&self) -> Vec<ToolCall> {
        match self {
            Self::Assistant { content, .. } => content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse {
                        id,
                        name,
                        arguments,
                    } => Some(ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    }),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stop reasons & usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
    Cancelled,
    Error,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::ToolUse => write!(f, "toolUse"),
            Self::ContentFilter => write!(f, "contentFilter"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Pointwise accumulation across turns.
    pub fn add(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.total_tokens += other.total_tokens;
    }
}

// ---------------------------------------------------------------------------
// Tool calls & results
// ---------------------------------------------------------------------------

/// A request from the model to invoke a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            details: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("Cancelled")]
    Cancelled,
}

/// Progress callback handed to tools; forwarded as `ToolCallUpdate` events.
pub type ToolUpdateFn = Arc<dyn Fn(ToolResult) + Send + Sync>;

/// A tool the agent can call. Implement this trait for your tools.
#[async_trait::async_trait]
pub trait AgentTool: Send + Sync {
    /// Unique tool name (used in the model's tool_use blocks).
    fn name(&self) -> &str;
    /// Human-readable label for UI.
    fn label(&self) -> &str {
        self.name()
    }
    /// Description for the model.
    fn description(&self) -> &str;
    /// JSON Schema (draft 2020-12) for the arguments.
    fn parameters_schema(&self) -> serde_json::Value;
    /// Serial tools run strictly after all preceding calls in the turn.
    fn serial(&self) -> bool {
        false
    }
    /// Re-entrant tools may run concurrently with themselves within a turn.
    fn reentrant(&self) -> bool {
        false
    }
    /// Execute the tool. Must observe `cancel` within a bounded delay.
    async fn execute(
        &self,
        call_id: &str,
        args: serde_json::Value,
        cancel: tokio_util::sync::CancellationToken,
        on_update: Option<ToolUpdateFn>,
    ) -> Result<ToolResult, ToolError>;
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    ProviderNotFound,
    ProviderTransport,
    ProviderProtocol,
    SchemaValidation,
    ToolExecution,
    Cancelled,
    SubscriberLagged,
    JournalIo,
    SubagentDepthExceeded,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProviderNotFound => "providerNotFound",
            Self::ProviderTransport => "providerTransport",
            Self::ProviderProtocol => "providerProtocol",
            Self::SchemaValidation => "schemaValidation",
            Self::ToolExecution => "toolExecution",
            Self::Cancelled => "cancelled",
            Self::SubscriberLagged => "subscriberLagged",
            Self::JournalIo => "journalIo",
            Self::SubagentDepthExceeded => "subagentDepthExceeded",
        };
        write!(f, "{}", name)
    }
}

// ---------------------------------------------------------------------------
// Agent events (broadcast to subscribers)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum StreamDelta {
    Text { delta: String },
    Thinking { delta: String },
    ToolArguments { call_id: String, delta: String },
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    TurnStarted,
    /// Streaming mutation of the in-progress assistant message. `partial`
    /// carries advisory state; only the final message is authoritative.
    AssistantDelta {
        partial: Message,
        delta: StreamDelta,
    },
    AssistantMessage {
        message: Message,
    },
    ToolCallStarted {
        call_id: String,
        name: String,
        label: String,
    },
    ToolCallUpdate {
        call_id: String,
        progress: ToolResult,
    },
    ToolCallFinished {
        call_id: String,
        content: Vec<ContentBlock>,
        is_error: bool,
    },
    UsageUpdated {
        usage: Usage,
        cost: f64,
    },
    TurnEnded {
        stop_reason: StopReason,
    },
    Idle,
    Error {
        kind: ErrorKind,
        message: String,
    },
    /// An event re-published from a subagent spawned by the `task` tool.
    Subagent {
        parent_call_id: String,
        event: Box<AgentEvent>,
    },
}

// ---------------------------------------------------------------------------
// Thinking level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
