use crate::model::Model;
use crate::types::{ErrorKind, Message, StopReason, Usage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted by a provider while streaming a completion.
///
/// `ToolUseDelta` carries raw JSON fragments of the arguments object; the
/// stream adapter reassembles them (§ partial-JSON reconstruction).
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    Start,
    TextDelta { index: usize, delta: String },
    ThinkingDelta { index: usize, delta: String },
    ToolUseStart { index: usize, id: String, name: String },
    ToolUseDelta { index: usize, delta: String },
    ToolUseEnd { index: usize },
    Usage(Usage),
    /// Terminal: the stream completed.
    Done { stop_reason: StopReason },
    /// Terminal: the stream failed. Providers must emit a terminal event
    /// even on failure.
    Error { message: String, retryable: bool },
}

/// Tool definition sent to the model (schema only, no execute fn).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// One streaming completion request.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub model: Model,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub options: StreamOptions,
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub thinking: crate::types::ThinkingLevel,
    /// Message indices at which a caching provider should place cache
    /// breakpoints. Computed by the adapter; ignored by providers that do
    /// not cache.
    pub cache_breakpoints: Vec<usize>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::ProviderTransport,
            Self::Protocol(_) => ErrorKind::ProviderProtocol,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Lazy, finite sequence of provider events ending in `Done` or `Error`.
pub type EventStream = mpsc::Receiver<ProviderEvent>;

/// The provider contract. Implement this per wire protocol; the registry
/// routes to implementations by `Model::api_id`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Open a streaming completion. Implementations must honour `cancel`
    /// within a bounded delay and always terminate the stream.
    async fn stream(
        &self,
        request: StreamRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<EventStream, ProviderError>;
}
