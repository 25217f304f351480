//! Shared application state for all routes. The registry is reloadable after
//! a studio save so new models are available without restart.

use crate::model::ModelRegistry;
use crate::query::{ExternalQueryService, QueryEngine};
use crate::service::ObjectService;
use sqlx::PgPool;
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    /// Reloaded after a studio save so new models are available without restart.
    pub registry: Arc<RwLock<ModelRegistry>>,
    pub engine: Arc<QueryEngine>,
    pub external: Arc<ExternalQueryService>,
    pub objects: Arc<ObjectService>,
}

impl AppState {
    /// Snapshot the current registry. A poisoned lock yields the last value.
    pub fn registry(&self) -> ModelRegistry {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replace_registry(&self, registry: ModelRegistry) {
        *self.registry.write().unwrap_or_else(|e| e.into_inner()) = registry;
    }
}
