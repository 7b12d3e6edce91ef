//! Provider registry — maps `api_id` to `Provider` implementations.
//!
//! Concurrent safe: reads take a shared lock, writes are serialised, and a
//! registration race on the same `api_id` resolves last-writer-wins. The
//! optional `source` tag supports bulk unregistration of externally-loaded
//! providers.

use super::traits::Provider;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

struct Entry {
    provider: Arc<dyn Provider>,
    source: Option<String>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, api_id: impl Into<String>, provider: Arc<dyn Provider>) {
        self.register_with_source(api_id, provider, None);
    }

    pub fn register_with_source(
        &self,
        api_id: impl Into<String>,
        provider: Arc<dyn Provider>,
        source: Option<String>,
    ) {
        let api_id = api_id.into();
        debug!(api_id = api_id.as_str(), ?source, "provider registered");
        self.entries
            .write()
            .expect("provider registry lock poisoned")
            .insert(api_id, Entry { provider, source });
    }

    pub fn get(&self, api_id: &str) -> Option<Arc<dyn Provider>> {
        self.entries
            .read()
            .expect("provider registry lock poisoned")
            .get(api_id)
            .map(|entry| Arc::clone(&entry.provider))
    }

    pub fn has(&self, api_id: &str) -> bool {
        self.entries
            .read()
            .expect("provider registry lock poisoned")
            .contains_key(api_id)
    }

    /// Remove every provider registered under the given source tag.
    /// Returns the number of entries removed.
    pub fn unregister_by_source(&self, source: &str) -> usize {
        let mut entries = self
            .entries
            .write()
            .expect("provider registry lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.source.as_deref() != Some(source));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .expect("provider registry lock poisoned")
            .clear();
    }

    pub fn api_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("provider registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
