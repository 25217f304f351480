//! Studio config handlers: read back models/views, save a full configuration.

use crate::error::AppError;
use crate::model::load_registry_from_pool;
use crate::response::{success_many, success_one_ok};
use crate::state::AppState;
use crate::store::{qualified_sys_table, save_studio_config, SaveRequest};
use axum::extract::State;
use axum::Json;
use serde_json::Value;
use sqlx::PgPool;

async fn get_payloads(pool: &PgPool, table: &str) -> Result<Vec<Value>, AppError> {
    let q_table = qualified_sys_table(table);
    let rows = sqlx::query_scalar::<_, Value>(&format!("SELECT payload FROM {} ORDER BY id", q_table))
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn get_models(
    State(state): State<AppState>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let out = get_payloads(&state.pool, "_sys_models").await?;
    Ok(success_many(out))
}

pub async fn get_views(
    State(state): State<AppState>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let out = get_payloads(&state.pool, "_sys_views").await?;
    Ok(success_many(out))
}

/// Reload the in-memory registry from the database so new and updated models
/// are available without restart.
pub(crate) async fn reload_registry(state: &AppState) -> Result<(), AppError> {
    let registry = load_registry_from_pool(&state.pool)
        .await
        .map_err(AppError::Config)?;
    state.replace_registry(registry);
    Ok(())
}

pub async fn save_studio(
    State(state): State<AppState>,
    Json(body): Json<SaveRequest>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let result = save_studio_config(&state.pool, &body).await?;
    if result.wrote_anything() {
        reload_registry(&state).await?;
    }
    Ok(success_one_ok(result))
}
