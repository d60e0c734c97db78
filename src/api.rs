//! HTTP platform adapter
//!
//! Inbound platform payloads, the per-conversation SSE outbound stream, the
//! worker reply endpoint, feedback and conversation lifecycle.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::runtime::ProductionManager;
use crate::worker::ModelRegistry;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<ProductionManager>,
    pub models: Arc<ModelRegistry>,
}

impl AppState {
    pub fn new(runtime: ProductionManager, models: Arc<ModelRegistry>) -> Self {
        Self {
            runtime: Arc::new(runtime),
            models,
        }
    }
}
