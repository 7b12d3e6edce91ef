//! Conversation context — single-writer message store with snapshot readers,
//! token estimation, and the compaction hook.

use crate::types::{ContentBlock, Message};
use tracing::debug;

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Rough token estimate: ~4 chars per token for English text. Good enough
/// for context budgeting; providers report authoritative usage afterwards.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

fn block_tokens(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => estimate_tokens(text),
        ContentBlock::Image { .. } => 1000,
        ContentBlock::Thinking { thinking } => estimate_tokens(thinking),
        ContentBlock::ToolUse {
            name, arguments, ..
        } => estimate_tokens(name) + estimate_tokens(&arguments.to_string()) + 8,
        ContentBlock::ToolResult { content, .. } => {
            content.iter().map(block_tokens).sum::<usize>() + 8
        }
    }
}

pub fn message_tokens(message: &Message) -> usize {
    message.content().iter().map(block_tokens).sum::<usize>() + 4
}

pub fn total_tokens(messages: &[Message]) -> usize {
    messages.iter().map(message_tokens).sum()
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

/// Context-shrinking hook invoked by the loop when the token estimate
/// approaches the model's context window.
pub trait CompactionPolicy: Send + Sync {
    /// Return a replacement message list, or `None` to leave the context
    /// untouched. `budget` is the target token count after compaction.
    fn compact(&self, messages: &[Message], budget: usize) -> Option<Vec<Message>>;
}

/// Default policy: preserve leading system messages, keep the most recent
/// messages that fit the budget, and summarise the elided region with a
/// single marker message.
pub struct DefaultCompaction;

impl CompactionPolicy for DefaultCompaction {
    fn compact(&self, messages: &[Message], budget: usize) -> Option<Vec<Message>> {
        if total_tokens(messages) <= budget {
            return None;
        }

        let head_len = messages
            .iter()
            .take_while(|m| matches!(m, Message::System { .. }))
            .count();
        let head = &messages[..head_len];
        let head_tokens = total_tokens(head);
        let marker_tokens = 24;
        let tail_budget = budget.saturating_sub(head_tokens + marker_tokens);

        // Walk backwards until the tail no longer fits.
        let mut tail_start = messages.len();
        let mut used = 0;
        while tail_start > head_len {
            let tokens = message_tokens(&messages[tail_start - 1]);
            if used + tokens > tail_budget {
                break;
            }
            used += tokens;
            tail_start -= 1;
        }

        if tail_start <= head_len {
            return None;
        }

        let elided = tail_start - head_len;
        let mut result = head.to_vec();
        result.push(Message::system(format!(
            "[Earlier conversation elided: {} messages removed to fit the context window]",
            elided
        )));
        result.extend_from_slice(&messages[tail_start..]);
        Some(result)
    }
}

// ---------------------------------------------------------------------------
// Context store
// ---------------------------------------------------------------------------

/// Ordered conversation store. Mutated only by the agent loop; readers get
/// immutable snapshots.
#[derive(Default)]
pub struct Context {
    messages: Vec<Message>,
    compaction_count: u32,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            compaction_count: 0,
        }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn token_estimate(&self) -> usize {
        total_tokens(&self.messages)
    }

    /// Number of times this context has been compacted.
    pub fn compaction_count(&self) -> u32 {
        self.compaction_count
    }

    /// Apply a compaction policy in place. Returns true if anything changed.
    pub fn compact(&mut self, policy: &dyn CompactionPolicy, budget: usize) -> bool {
        match policy.compact(&self.messages, budget) {
            Some(replacement) => {
                debug!(
                    before = self.messages.len(),
                    after = replacement.len(),
                    "context compacted"
                );
                self.messages = replacement;
                self.compaction_count += 1;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_is_roughly_chars_over_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert!(estimate_tokens("hello world") > 0);
        assert!(estimate_tokens("hello world") < 10);
    }

    #[test]
    fn compaction_within_budget_is_noop() {
        let mut ctx = Context::new();
        ctx.append(Message::user("hello"));
        ctx.append(Message::user("world"));
        assert!(!ctx.compact(&DefaultCompaction, 100_000));
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn compaction_keeps_system_head_and_recent_tail() {
        let mut messages = vec![Message::system("you are terse")];
        for n in 0..50 {
            messages.push(Message::user(format!(
                "message {} padding padding padding padding padding",
                n
            )));
        }
        let mut ctx = Context::from_messages(messages);

        assert!(ctx.compact(&DefaultCompaction, 200));
        let snapshot = ctx.snapshot();

        assert!(snapshot.len() < 52);
        assert_eq!(snapshot[0].role(), "system");
        // Marker summarising the elided region follows the head.
        match &snapshot[1] {
            Message::System { content, .. } => match &content[0] {
                ContentBlock::Text { text } => assert!(text.contains("elided")),
                other => panic!("unexpected block {:?}", other),
            },
            other => panic!("unexpected message {:?}", other),
        }
        // The most recent message always survives.
        let last_text = match snapshot.last() {
            Some(Message::User { content, .. }) => match &content[0] {
                ContentBlock::Text { text } => text.clone(),
                _ => String::new(),
            },
            _ => String::new(),
        };
        assert!(last_text.contains("message 49"));
        assert_eq!(ctx.compaction_count(), 1);
    }
}
