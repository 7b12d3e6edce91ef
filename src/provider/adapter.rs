//! Stream adapter — normalises provider event streams into assistant
//! messages and core events, and owns the provider-quirk helpers: partial
//! JSON reconstruction for streaming tool arguments, tool-id normalisation,
//! thinking-block flattening, and cache-breakpoint placement.

use super::traits::{ProviderError, ProviderEvent};
use crate::types::{
    new_id, now_ms, ContentBlock, Message, StopReason, StreamDelta, Usage,
};
use tracing::warn;

const TOOL_ID_MAX_LEN: usize = 40;

/// Restrict a provider-supplied tool id to `[A-Za-z0-9_-]`, truncated to 40
/// chars. Empty after filtering yields a fresh opaque id.
pub fn normalize_tool_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(TOOL_ID_MAX_LEN)
        .collect();
    if cleaned.is_empty() {
        format!("call_{}", &new_id()[..8])
    } else {
        cleaned
    }
}

/// Parse the longest valid prefix of a streaming JSON fragment: try the full
/// string, then shrink from the end until a value is accepted. Partial
/// results are advisory; only the final assembled arguments are validated.
pub fn parse_partial_json(fragment: &str) -> Option<serde_json::Value> {
    let trimmed = fragment.trim();
    if trimmed.is_empty() {
        return None;
    }
    for end in (1..=trimmed.len()).rev() {
        if !trimmed.is_char_boundary(end) {
            continue;
        }
        if let Ok(value) = serde_json::from_str(&trimmed[..end]) {
            return Some(value);
        }
    }
    None
}

/// Rewrite thinking blocks as plain text for models without native
/// reasoning support.
pub fn flatten_thinking(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .map(|message| match message {
            Message::Assistant {
                id,
                content,
                stop_reason,
                model,
                provider,
                usage,
                timestamp,
                error_message,
            } => Message::Assistant {
                id,
                content: content
                    .into_iter()
                    .map(|block| match block {
                        ContentBlock::Thinking { thinking } => ContentBlock::Text {
                            text: format!("<thinking>{}</thinking>", thinking),
                        },
                        other => other,
                    })
                    .collect(),
                stop_reason,
                model,
                provider,
                usage,
                timestamp,
                error_message,
            },
            other => other,
        })
        .collect()
}

/// Message indices at which caching providers should place breakpoints:
/// the second-to-last and last message, so the conversation prefix is
/// reusable across consecutive turns. System prompt and tool definitions
/// are cached by providers unconditionally.
pub fn cache_breakpoints(message_count: usize) -> Vec<usize> {
    match message_count {
        0 => Vec::new(),
        1 => vec![0],
        n => vec![n - 2, n - 1],
    }
}

// ---------------------------------------------------------------------------
// Turn assembly
// ---------------------------------------------------------------------------

enum PartialBlock {
    Text(String),
    Thinking(String),
    ToolUse {
        id: String,
        name: String,
        arguments_json: String,
    },
}

impl PartialBlock {
    fn to_block(&self, final_parse: bool) -> ContentBlock {
        match self {
            Self::Text(text) => ContentBlock::Text { text: text.clone() },
            Self::Thinking(thinking) => ContentBlock::Thinking {
                thinking: thinking.clone(),
            },
            Self::ToolUse {
                id,
                name,
                arguments_json,
            } => {
                let arguments = if arguments_json.trim().is_empty() {
                    serde_json::json!({})
                } else if final_parse {
                    serde_json::from_str(arguments_json).unwrap_or_else(|e| {
                        warn!(tool = name.as_str(), error = %e, "unparseable tool arguments");
                        serde_json::Value::Null
                    })
                } else {
                    parse_partial_json(arguments_json).unwrap_or(serde_json::Value::Null)
                };
                ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    arguments,
                }
            }
        }
    }
}

/// Accumulates provider events into an assistant message. One assembler per
/// turn; per-turn scratch state is discarded with it.
pub struct TurnAssembler {
    message_id: String,
    model_id: String,
    provider_id: String,
    blocks: Vec<PartialBlock>,
    usage: Usage,
    outcome: Option<Result<StopReason, ProviderError>>,
}

impl TurnAssembler {
    pub fn new(model_id: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            message_id: new_id(),
            model_id: model_id.into(),
            provider_id: provider_id.into(),
            blocks: Vec::new(),
            usage: Usage::default(),
            outcome: None,
        }
    }

    fn ensure_index(&mut self, index: usize) {
        while self.blocks.len() <= index {
            self.blocks.push(PartialBlock::Text(String::new()));
        }
    }

    /// Apply one provider event. Returns the core delta to broadcast, if
    /// the event mutated visible content.
    pub fn apply(&mut self, event: ProviderEvent) -> Option<StreamDelta> {
        match event {
            ProviderEvent::Start => None,
            ProviderEvent::TextDelta { index, delta } => {
                self.ensure_index(index);
                if let PartialBlock::Text(text) = &mut self.blocks[index] {
                    text.push_str(&delta);
                }
                Some(StreamDelta::Text { delta })
            }
            ProviderEvent::ThinkingDelta { index, delta } => {
                self.ensure_index(index);
                match &mut self.blocks[index] {
                    PartialBlock::Thinking(thinking) => thinking.push_str(&delta),
                    block @ PartialBlock::Text(_) => {
                        *block = PartialBlock::Thinking(delta.clone());
                    }
                    _ => {}
                }
                Some(StreamDelta::Thinking { delta })
            }
            ProviderEvent::ToolUseStart { index, id, name } => {
                self.ensure_index(index);
                self.blocks[index] = PartialBlock::ToolUse {
                    id: normalize_tool_id(&id),
                    name,
                    arguments_json: String::new(),
                };
                None
            }
            ProviderEvent::ToolUseDelta { index, delta } => {
                self.ensure_index(index);
                if let PartialBlock::ToolUse {
                    id, arguments_json, ..
                } = &mut self.blocks[index]
                {
                    arguments_json.push_str(&delta);
                    let call_id = id.clone();
                    return Some(StreamDelta::ToolArguments { call_id, delta });
                }
                None
            }
            ProviderEvent::ToolUseEnd { .. } => None,
            ProviderEvent::Usage(usage) => {
                self.usage = usage;
                None
            }
            ProviderEvent::Done { stop_reason } => {
                self.outcome = Some(Ok(stop_reason));
                None
            }
            ProviderEvent::Error { message, retryable } => {
                self.outcome = Some(Err(ProviderError::Transport { message, retryable }));
                None
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Advisory snapshot of the in-progress assistant message.
    pub fn partial_message(&self) -> Message {
        Message::Assistant {
            id: self.message_id.clone(),
            content: self.blocks.iter().map(|b| b.to_block(false)).collect(),
            stop_reason: StopReason::Stop,
            model: self.model_id.clone(),
            provider: self.provider_id.clone(),
            usage: self.usage.clone(),
            timestamp: now_ms(),
            error_message: None,
        }
    }

    /// Finalise the assistant message. A stream that ended without a
    /// terminal event is a protocol error.
    pub fn finish(self) -> Result<(Message, Usage), ProviderError> {
        let stop_reason = match self.outcome {
            Some(Ok(stop_reason)) => stop_reason,
            Some(Err(error)) => return Err(error),
            None => {
                return Err(ProviderError::Protocol(
                    "stream ended without a terminal event".into(),
                ))
            }
        };

        let content: Vec<ContentBlock> = self
            .blocks
            .iter()
            .map(|b| b.to_block(true))
            .filter(|block| !matches!(block, ContentBlock::Text { text } if text.is_empty()))
            .collect();

        let message = Message::Assistant {
            id: self.message_id,
            content,
            stop_reason,
            model: self.model_id,
            provider: self.provider_id,
            usage: self.usage.clone(),
            timestamp: now_ms(),
            error_message: None,
        };
        Ok((message, self.usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_ids_are_restricted_and_truncated() {
        assert_eq!(normalize_tool_id("call_123"), "call_123");
        assert_eq!(normalize_tool_id("ab c!d"), "abcd");
        let long = "x".repeat(100);
        assert_eq!(normalize_tool_id(&long).len(), 40);
        // Nothing survives filtering: a fresh opaque id is minted.
        let minted = normalize_tool_id("!!!");
        assert!(minted.starts_with("call_"));
    }

    #[test]
    fn partial_json_accepts_longest_valid_prefix() {
        assert_eq!(
            parse_partial_json(r#"{"path":"/tmp/x"}"#),
            Some(serde_json::json!({"path":"/tmp/x"}))
        );
        // `{}` followed by trailing garbage: the prefix wins.
        assert_eq!(parse_partial_json("{} trailing"), Some(serde_json::json!({})));
        assert_eq!(parse_partial_json(r#"{"path":"#), None);
        assert_eq!(parse_partial_json(""), None);
    }

    #[test]
    fn assembler_round_trips_a_text_stream() {
        let mut assembler = TurnAssembler::new("m1", "acme");
        assembler.apply(ProviderEvent::Start);
        assembler.apply(ProviderEvent::TextDelta {
            index: 0,
            delta: "hel".into(),
        });
        assembler.apply(ProviderEvent::TextDelta {
            index: 0,
            delta: "lo".into(),
        });
        assembler.apply(ProviderEvent::Done {
            stop_reason: StopReason::Stop,
        });

        let (message, _) = assembler.finish().unwrap();
        assert_eq!(
            message.content(),
            &[ContentBlock::text("hello")]
        );
    }

    #[test]
    fn assembler_reassembles_streamed_tool_arguments() {
        let mut assembler = TurnAssembler::new("m1", "acme");
        assembler.apply(ProviderEvent::ToolUseStart {
            index: 0,
            id: "c1".into(),
            name: "read".into(),
        });
        assembler.apply(ProviderEvent::ToolUseDelta {
            index: 0,
            delta: r#"{"path":"#.into(),
        });
        assembler.apply(ProviderEvent::ToolUseDelta {
            index: 0,
            delta: r#""/tmp/x"}"#.into(),
        });
        assembler.apply(ProviderEvent::ToolUseEnd { index: 0 });
        assembler.apply(ProviderEvent::Done {
            stop_reason: StopReason::ToolUse,
        });

        let (message, _) = assembler.finish().unwrap();
        let calls = message.tool_uses();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, serde_json::json!({"path": "/tmp/x"}));
    }

    #[test]
    fn missing_terminal_event_is_a_protocol_error() {
        let mut assembler = TurnAssembler::new("m1", "acme");
        assembler.apply(ProviderEvent::TextDelta {
            index: 0,
            delta: "partial".into(),
        });
        assert!(matches!(
            assembler.finish(),
            Err(ProviderError::Protocol(_))
        ));
    }

    #[test]
    fn breakpoints_cover_the_recent_suffix() {
        assert!(cache_breakpoints(0).is_empty());
        assert_eq!(cache_breakpoints(1), vec![0]);
        assert_eq!(cache_breakpoints(6), vec![4, 5]);
    }

    #[test]
    fn thinking_flattens_to_tagged_text() {
        let message = Message::Assistant {
            id: new_id(),
            content: vec![ContentBlock::Thinking {
                thinking: "hmm".into(),
            }],
            stop_reason: StopReason::Stop,
            model: "m1".into(),
            provider: "acme".into(),
            usage: Usage::default(),
            timestamp: 0,
            error_message: None,
        };
        let flattened = flatten_thinking(vec![message]);
        assert_eq!(
            flattened[0].content(),
            &[ContentBlock::text("<thinking>hmm</thinking>")]
        );
    }
}
