//! Handler registry
//!
//! Lookup table from job kind to the handler that executes it.

use quill_core::domain::job::JobKind;
use std::collections::HashMap;
use std::sync::Arc;

use super::StepHandler;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`, replacing any previous one
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn StepHandler>) -> &mut Self {
        if self.handlers.insert(kind, handler).is_some() {
            tracing::warn!("Replacing step handler for {}", kind);
        }
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Registered kinds, for startup logging
    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }
}
