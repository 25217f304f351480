//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("view not found: {0}")]
    ViewNotFound(String),
    #[error("duplicate field '{field}' in model '{model}'")]
    DuplicateField { model: String, field: String },
    #[error("relational field '{field}' in model '{model}' has no ref_model")]
    MissingRefModel { model: String, field: String },
    #[error("view '{view}' references unknown field '{field}'")]
    UnknownViewField { view: String, field: String },
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unsupported filter operator: {0}")]
    UnsupportedOperator(String),
    #[error("unsupported aggregation: {0}")]
    UnsupportedAggregation(String),
    #[error("unsafe identifier: {0}")]
    UnsafeIdentifier(String),
    #[error("no column mapping for field: {0}")]
    UnmappedField(String),
    #[error("unknown system field: {0}")]
    UnknownSystemField(String),
    #[error("references are not supported for external models")]
    ExternalReference,
    #[error("failed to acquire external database pool: {0}")]
    ExternalPool(String),
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Config(_) => (StatusCode::UNPROCESSABLE_ENTITY, "config_error"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            AppError::Db(e) => {
                if let sqlx::Error::RowNotFound = e {
                    (StatusCode::NOT_FOUND, "not_found")
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "database_error")
                }
            }
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::UnsupportedOperator(_) => (StatusCode::BAD_REQUEST, "unsupported_operator"),
            AppError::UnsupportedAggregation(_) => (StatusCode::BAD_REQUEST, "unsupported_aggregation"),
            AppError::UnsafeIdentifier(_) => (StatusCode::UNPROCESSABLE_ENTITY, "unsafe_identifier"),
            AppError::UnmappedField(_) => (StatusCode::UNPROCESSABLE_ENTITY, "unmapped_field"),
            AppError::UnknownSystemField(_) => (StatusCode::BAD_REQUEST, "unknown_system_field"),
            AppError::ExternalReference => (StatusCode::BAD_REQUEST, "external_reference"),
            AppError::ExternalPool(_) => (StatusCode::SERVICE_UNAVAILABLE, "external_pool"),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
