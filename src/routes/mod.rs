pub mod common;
pub mod config;
pub mod objects;

use crate::state::AppState;
use axum::Router;

/// Full API surface mounted under one router.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .merge(common::common_routes_with_ready(state.clone()))
        .merge(config::config_routes(state.clone()))
        .merge(objects::object_routes(state))
}
