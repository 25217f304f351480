//! Model/view registry: validated lookup tables loaded from the _sys_* tables.

use crate::error::{AppError, ConfigError};
use crate::model::types::{Model, View};
use crate::store::qualified_sys_table;
use sqlx::PgPool;
use std::collections::HashMap;

#[derive(Clone, Debug, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Model>,
    views: HashMap<String, View>,
    views_by_model: HashMap<String, Vec<String>>,
}

impl ModelRegistry {
    /// Build a registry from loaded models and views; validates before indexing.
    pub fn from_parts(models: Vec<Model>, views: Vec<View>) -> Result<Self, ConfigError> {
        validate(&models, &views)?;
        let mut views_by_model: HashMap<String, Vec<String>> = HashMap::new();
        for v in &views {
            views_by_model
                .entry(v.model_name.clone())
                .or_default()
                .push(v.name.clone());
        }
        Ok(ModelRegistry {
            models: models.into_iter().map(|m| (m.name.clone(), m)).collect(),
            views: views.into_iter().map(|v| (v.name.clone(), v)).collect(),
            views_by_model,
        })
    }

    pub fn model(&self, name: &str) -> Option<&Model> {
        self.models.get(name)
    }

    pub fn require_model(&self, name: &str) -> Result<&Model, AppError> {
        self.model(name)
            .ok_or_else(|| AppError::Config(ConfigError::ModelNotFound(name.to_string())))
    }

    pub fn view(&self, name: &str) -> Option<&View> {
        self.views.get(name)
    }

    pub fn require_view(&self, name: &str) -> Result<&View, AppError> {
        self.view(name)
            .ok_or_else(|| AppError::Config(ConfigError::ViewNotFound(name.to_string())))
    }

    pub fn views_for_model(&self, model_name: &str) -> Vec<&View> {
        self.views_by_model
            .get(model_name)
            .map(|names| names.iter().filter_map(|n| self.views.get(n)).collect())
            .unwrap_or_default()
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }
}

/// Referential checks: unique field names per model, relational fields carry a
/// resolvable ref_model, views reference existing models, view items reference
/// model fields or `$$`-synthetics.
pub fn validate(models: &[Model], views: &[View]) -> Result<(), ConfigError> {
    let model_names: std::collections::HashSet<&str> =
        models.iter().map(|m| m.name.as_str()).collect();

    for m in models {
        let mut seen = std::collections::HashSet::new();
        for f in &m.fields {
            if !seen.insert(f.name.as_str()) {
                return Err(ConfigError::DuplicateField {
                    model: m.name.clone(),
                    field: f.name.clone(),
                });
            }
            if f.field_type.is_relation() {
                match f.ref_model.as_deref() {
                    Some(target) if model_names.contains(target) => {}
                    Some(target) => return Err(ConfigError::ModelNotFound(target.to_string())),
                    None => {
                        return Err(ConfigError::MissingRefModel {
                            model: m.name.clone(),
                            field: f.name.clone(),
                        })
                    }
                }
            }
        }
    }

    for v in views {
        let Some(model) = models.iter().find(|m| m.name == v.model_name) else {
            return Err(ConfigError::ModelNotFound(v.model_name.clone()));
        };
        for item in &v.items {
            if item.name.starts_with("$$") {
                continue;
            }
            if model.field(&item.name).is_none() {
                return Err(ConfigError::UnknownViewField {
                    view: v.name.clone(),
                    field: item.name.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Load the full registry from the _sys_models/_sys_views tables.
pub async fn load_registry_from_pool(pool: &PgPool) -> Result<ModelRegistry, ConfigError> {
    let models = load_payload_table::<Model>(pool, &qualified_sys_table("_sys_models")).await?;
    let views = load_payload_table::<View>(pool, &qualified_sys_table("_sys_views")).await?;
    ModelRegistry::from_parts(models, views)
}

async fn load_payload_table<T>(pool: &PgPool, table: &str) -> Result<Vec<T>, ConfigError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let sql = format!("SELECT payload FROM {} ORDER BY id", table);
    tracing::debug!(sql = %sql, "query");
    let rows = sqlx::query_scalar::<_, serde_json::Value>(&sql)
        .fetch_all(pool)
        .await
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let value: T = serde_json::from_value(row).map_err(|e| ConfigError::Load(e.to_string()))?;
        out.push(value);
    }
    Ok(out)
}
