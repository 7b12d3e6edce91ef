//! Model descriptors — everything the loop needs to route and price a call.

use crate::types::Usage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Input modality accepted by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Text,
    Image,
}

/// Cost per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CostTable {
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default)]
    pub cache_read_per_million: f64,
    #[serde(default)]
    pub cache_write_per_million: f64,
}

impl CostTable {
    /// Dollar cost of accumulated usage under this table.
    pub fn cost_of(&self, usage: &Usage) -> f64 {
        (usage.input as f64 * self.input_per_million
            + usage.output as f64 * self.output_per_million
            + usage.cache_read as f64 * self.cache_read_per_million
            + usage.cache_write as f64 * self.cache_write_per_million)
            / 1_000_000.0
    }
}

/// Immutable model descriptor. `api_id` selects the provider in the registry;
/// `provider_id` is informational (billing, display).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub provider_id: String,
    pub api_id: String,
    pub base_url: String,
    pub reasoning: bool,
    pub input_kinds: BTreeSet<InputKind>,
    #[serde(default)]
    pub cost: CostTable,
    pub context_window: u32,
    pub max_tokens: u32,
}

impl Model {
    /// A minimal text-only model descriptor, useful in tests and as a
    /// starting point for builders.
    pub fn new(id: impl Into<String>, provider_id: impl Into<String>, api_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            api_id: api_id.into(),
            base_url: String::new(),
            reasoning: false,
            input_kinds: BTreeSet::from([InputKind::Text]),
            cost: CostTable::default(),
            context_window: 128_000,
            max_tokens: 8_192,
        }
    }

    pub fn with_reasoning(mut self, reasoning: bool) -> Self {
        self.reasoning = reasoning;
        self
    }

    pub fn with_context_window(mut self, window: u32) -> Self {
        self.context_window = window;
        self
    }

    pub fn with_cost(mut self, cost: CostTable) -> Self {
        self.cost = cost;
        self
    }

    pub fn accepts(&self, kind: InputKind) -> bool {
        self.input_kinds.contains(&kind)
    }
}
