//! Mock provider for testing. No real API calls.

use super::traits::*;
use crate::types::{StopReason, Usage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One scripted turn of the mock provider.
#[derive(Debug, Clone)]
pub enum MockTurn {
    /// Stream the text as a couple of deltas, then `Done(stop)`.
    Text(String),
    /// Emit tool-use blocks (id, name, arguments), then `Done(tool_use)`.
    ToolUses(Vec<(String, String, serde_json::Value)>),
    /// Fail when opening the stream.
    TransportFailure { message: String, retryable: bool },
    /// Emit a raw event script verbatim.
    Script(Vec<ProviderEvent>),
}

/// Scripted provider: pops one `MockTurn` per `stream` call. Once the
/// script is exhausted it keeps answering with a fixed text turn.
pub struct MockProvider {
    turns: Mutex<VecDeque<MockTurn>>,
    /// Pause before each event, to give tests a window to cancel mid-stream.
    event_delay: Option<Duration>,
}

impl MockProvider {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            event_delay: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![MockTurn::Text(text.into())])
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }

    fn script_for(turn: MockTurn) -> Vec<ProviderEvent> {
        match turn {
            MockTurn::Text(text) => {
                let mid = text.len() / 2;
                let mid = (0..=mid)
                    .rev()
                    .find(|i| text.is_char_boundary(*i))
                    .unwrap_or(0);
                let (head, tail) = text.split_at(mid);
                let mut events = vec![ProviderEvent::Start];
                if !head.is_empty() {
                    events.push(ProviderEvent::TextDelta {
                        index: 0,
                        delta: head.to_string(),
                    });
                }
                events.push(ProviderEvent::TextDelta {
                    index: 0,
                    delta: tail.to_string(),
                });
                events.push(ProviderEvent::Usage(Usage {
                    input: 10,
                    output: 5,
                    total_tokens: 15,
                    ..Usage::default()
                }));
                events.push(ProviderEvent::Done {
                    stop_reason: StopReason::Stop,
                });
                events
            }
            MockTurn::ToolUses(calls) => {
                let mut events = vec![ProviderEvent::Start];
                for (index, (id, name, arguments)) in calls.into_iter().enumerate() {
                    events.push(ProviderEvent::ToolUseStart { index, id, name });
                    events.push(ProviderEvent::ToolUseDelta {
                        index,
                        delta: arguments.to_string(),
                    });
                    events.push(ProviderEvent::ToolUseEnd { index });
                }
                events.push(ProviderEvent::Usage(Usage {
                    input: 10,
                    output: 5,
                    total_tokens: 15,
                    ..Usage::default()
                }));
                events.push(ProviderEvent::Done {
                    stop_reason: StopReason::ToolUse,
                });
                events
            }
            MockTurn::TransportFailure { .. } => Vec::new(),
            MockTurn::Script(events) => events,
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn stream(
        &self,
        _request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ProviderError> {
        let turn = self
            .turns
            .lock()
            .expect("mock script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| MockTurn::Text("(no more mock responses)".into()));

        let events = match turn {
            MockTurn::TransportFailure { message, retryable } => {
                return Err(ProviderError::Transport { message, retryable })
            }
            other => Self::script_for(other),
        };
        let delay = self.event_delay;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for event in events {
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = tx
                                .send(ProviderEvent::Done {
                                    stop_reason: StopReason::Cancelled,
                                })
                                .await;
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
