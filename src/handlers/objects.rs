//! Object handlers: declarative queries, grouped queries, hierarchy reads,
//! and CRUD. Every handler resolves the model first and dispatches to the
//! internal engine or the external service behind the same querier trait.

use crate::error::AppError;
use crate::model::Model;
use crate::response::{success_one, success_one_ok, success_page};
use crate::state::AppState;
use crate::query::{ObjectQuerier, QueryRequest};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

fn querier<'a>(state: &'a AppState, model: &Model) -> &'a dyn ObjectQuerier {
    if model.external.is_some() {
        state.external.as_ref()
    } else {
        state.engine.as_ref()
    }
}

/// External models are read-only projections; writes only target the
/// internal store.
fn require_internal(model: &Model) -> Result<(), AppError> {
    if model.external.is_some() {
        return Err(AppError::BadRequest(format!(
            "external model is read-only: {}",
            model.name
        )));
    }
    Ok(())
}

pub async fn query_objects(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let registry = state.registry();
    let model = registry.require_model(&req.model_name)?;
    let page = querier(&state, model).list_objects(model, &req).await?;
    Ok(success_page(page.data, page.count))
}

pub async fn query_grouped(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let registry = state.registry();
    let model = registry.require_model(&req.model_name)?;
    let result = querier(&state, model)
        .find_grouped_objects(model, &req)
        .await?;
    Ok(success_one_ok(result))
}

pub async fn get_tree(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let registry = state.registry();
    let model = registry.require_model(&model_name)?;
    if model.external.is_some() {
        return Err(AppError::ExternalReference);
    }
    let forest = state.engine.full_tree(model).await?;
    let total = forest.len() as i64;
    Ok(success_page(forest, total))
}

#[derive(Deserialize)]
pub struct DeepParams {
    /// Comma-separated relation fields to follow from the root.
    pub fields: Option<String>,
}

pub async fn get_deep_object(
    State(state): State<AppState>,
    Path((model_name, id)): Path<(String, String)>,
    Query(params): Query<DeepParams>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let registry = state.registry();
    let model = registry.require_model(&model_name)?;
    if model.external.is_some() {
        return Err(AppError::ExternalReference);
    }
    let fields: Option<Vec<String>> = params.fields.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect()
    });
    let object = state
        .engine
        .deep_object(model, &id, fields.as_deref())
        .await?;
    Ok(success_one_ok(object))
}

pub async fn get_object(
    State(state): State<AppState>,
    Path((model_name, id)): Path<(String, String)>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let registry = state.registry();
    let model = registry.require_model(&model_name)?;
    require_internal(model)?;
    let object = state.objects.get(model, &id).await?;
    Ok(success_one_ok(object))
}

pub async fn create_object(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
    Json(values): Json<Value>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let registry = state.registry();
    let model = registry.require_model(&model_name)?;
    require_internal(model)?;
    let object = state.objects.create(model, values).await?;
    Ok(success_one(object))
}

pub async fn update_object(
    State(state): State<AppState>,
    Path((model_name, id)): Path<(String, String)>,
    Json(patch): Json<Value>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let registry = state.registry();
    let model = registry.require_model(&model_name)?;
    require_internal(model)?;
    let object = state.objects.update(model, &id, patch).await?;
    Ok(success_one_ok(object))
}

pub async fn delete_object(
    State(state): State<AppState>,
    Path((model_name, id)): Path<(String, String)>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let registry = state.registry();
    let model = registry.require_model(&model_name)?;
    require_internal(model)?;
    state.objects.delete(model, &id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
