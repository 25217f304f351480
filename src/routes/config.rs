//! Studio config routes: read back models/views, save a configuration.

use crate::handlers::config::{get_models, get_views, save_studio};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn config_routes(state: AppState) -> Router {
    Router::new()
        .route("/models", get(get_models))
        .route("/views", get(get_views))
        .route("/studio/save", post(save_studio))
        .with_state(state)
}
