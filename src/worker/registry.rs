//! Model registry for the answerers a worker can serve

use super::{Answerer, LoggingAnswerer, RetrievalService};
use crate::config::RetrievalConfig;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available answer models
#[derive(Default)]
pub struct ModelRegistry {
    answerers: HashMap<String, Arc<dyn Answerer>>,
}

impl ModelRegistry {
    /// Create an empty registry
    pub fn new_empty() -> Self {
        Self::default()
    }

    /// One retrieval-backed answerer per configured model id. Without a
    /// retrieval URL the registry stays empty.
    pub fn new(config: &RetrievalConfig) -> Self {
        let mut registry = Self::new_empty();
        let Some(url) = config.url.as_deref() else {
            return registry;
        };
        for model_id in &config.models {
            match RetrievalService::new(url, model_id) {
                Ok(service) => {
                    registry.register(Arc::new(service));
                }
                Err(e) => {
                    tracing::warn!(model = %model_id, error = %e, "Skipping retrieval model");
                }
            }
        }
        registry
    }

    /// Register an answerer under its own model id, wrapped with logging
    pub fn register(&mut self, answerer: Arc<dyn Answerer>) -> &mut Self {
        let model_id = answerer.model_id().to_string();
        self.answerers
            .insert(model_id, Arc::new(LoggingAnswerer::new(answerer)));
        self
    }

    /// Get a model by ID
    pub fn get(&self, model_id: &str) -> Option<Arc<dyn Answerer>> {
        self.answerers.get(model_id).cloned()
    }

    /// List all available model IDs
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.answerers.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn has_models(&self) -> bool {
        !self.answerers.is_empty()
    }
}
