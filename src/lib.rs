//! tangent — an embeddable agent orchestration core.
//!
//! Given a user prompt, an [`Agent`] drives a conversation with an LLM
//! provider: it pumps streaming events, dispatches validated tool calls
//! with bounded concurrency, feeds results back, and loops until the model
//! stops requesting tools. Runs can be steered mid-flight, followed up,
//! paused before tool dispatch, cancelled, and journaled to disk.
//!
//! Providers and tools are pluggable contracts ([`provider::Provider`],
//! [`AgentTool`]); the crate ships a scripted [`provider::MockProvider`]
//! for tests plus a small built-in tool set.

pub mod agent;
pub mod bus;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod model;
pub mod provider;
pub mod retry;
pub mod session;
pub mod subagent;
pub mod tools;
pub mod types;

pub use agent::{Agent, AgentBuilder, AgentOptions, AgentRuntime, AgentState, PausePolicy};
pub use bus::{EventBus, EventSubscriber};
pub use config::resolve_value;
pub use context::{CompactionPolicy, Context, DefaultCompaction};
pub use dispatch::{DispatchConfig, ToolDispatcher};
pub use model::{CostTable, InputKind, Model};
pub use retry::RetryConfig;
pub use session::{SessionEntry, SessionJournal, CURRENT_VERSION};
pub use subagent::{load_definition, parse_definition, AgentDefinition, SpawnsPolicy, TaskTool};
pub use types::*;
