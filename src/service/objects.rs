//! Transactional object CRUD. Relation fields in a payload are mirrored into
//! the edge table inside the same transaction, so reference queries and tree
//! reconstruction never observe a half-written object.

use crate::error::AppError;
use crate::model::{Field, Model};
use crate::pg::row_to_value;
use crate::query::builder::InternalTables;
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

pub struct ObjectService {
    pool: PgPool,
    tables: InternalTables,
}

impl ObjectService {
    pub fn new(pool: PgPool, tables: InternalTables) -> Self {
        ObjectService { pool, tables }
    }

    pub async fn get(&self, model: &Model, id: &str) -> Result<Value, AppError> {
        let sql = format!(
            "SELECT id, model_name, \"values\", created_at, updated_at \
             FROM {} WHERE id = $1::uuid AND model_name = $2",
            self.tables.objects
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&model.name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("object not found: {}", id)))?;
        Ok(row_to_value(&row))
    }

    pub async fn create(&self, model: &Model, values: Value) -> Result<Value, AppError> {
        let values = as_object(values)?;
        let id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "INSERT INTO {} (id, model_name, \"values\") VALUES ($1, $2, $3::jsonb) \
             RETURNING id, model_name, \"values\", created_at, updated_at",
            self.tables.objects
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&model.name)
            .bind(Value::Object(values.clone()))
            .fetch_one(&mut *tx)
            .await?;
        for field in model.fields.iter().filter(|f| f.field_type.is_relation()) {
            if let Some(value) = values.get(&field.name) {
                self.replace_edges(&mut tx, model, field, &id.to_string(), value)
                    .await?;
            }
        }
        tx.commit().await?;
        tracing::debug!(model = %model.name, id = %id, "object created");
        Ok(row_to_value(&row))
    }

    pub async fn update(&self, model: &Model, id: &str, patch: Value) -> Result<Value, AppError> {
        let patch = as_object(patch)?;
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE {} SET \"values\" = \"values\" || $3::jsonb, updated_at = NOW() \
             WHERE id = $1::uuid AND model_name = $2 \
             RETURNING id, model_name, \"values\", created_at, updated_at",
            self.tables.objects
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&model.name)
            .bind(Value::Object(patch.clone()))
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("object not found: {}", id)))?;
        for field in model.fields.iter().filter(|f| f.field_type.is_relation()) {
            if let Some(value) = patch.get(&field.name) {
                self.replace_edges(&mut tx, model, field, id, value).await?;
            }
        }
        tx.commit().await?;
        tracing::debug!(model = %model.name, id = %id, "object updated");
        Ok(row_to_value(&row))
    }

    pub async fn delete(&self, model: &Model, id: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        let edges = format!(
            "DELETE FROM {} WHERE from_object_id = $1::uuid OR to_object_id = $1::uuid",
            self.tables.references
        );
        sqlx::query(&edges).bind(id).execute(&mut *tx).await?;
        let sql = format!(
            "DELETE FROM {} WHERE id = $1::uuid AND model_name = $2",
            self.tables.objects
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(&model.name)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("object not found: {}", id)));
        }
        tx.commit().await?;
        tracing::debug!(model = %model.name, id = %id, "object deleted");
        Ok(())
    }

    /// Drop and re-create the edges for one relation field of one object.
    async fn replace_edges(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        model: &Model,
        field: &Field,
        from_id: &str,
        value: &Value,
    ) -> Result<(), AppError> {
        let to_model = field.ref_model.as_deref().ok_or_else(|| {
            AppError::Validation(format!("relation field has no ref_model: {}", field.name))
        })?;
        let clear = format!(
            "DELETE FROM {} WHERE from_object_id = $1::uuid AND from_field_name = $2",
            self.tables.references
        );
        sqlx::query(&clear)
            .bind(from_id)
            .bind(&field.name)
            .execute(&mut **tx)
            .await?;

        let targets = edge_targets(field, value)?;
        let insert = format!(
            "INSERT INTO {} \
             (from_model_name, from_field_name, from_object_id, to_model_name, to_object_id) \
             VALUES ($1, $2, $3::uuid, $4, $5::uuid)",
            self.tables.references
        );
        for target in targets {
            sqlx::query(&insert)
                .bind(&model.name)
                .bind(&field.name)
                .bind(from_id)
                .bind(to_model)
                .bind(&target)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

fn as_object(value: Value) -> Result<Map<String, Value>, AppError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::Validation("values must be a JSON object".into())),
    }
}

/// Target object ids named by a relation field value: a bare id string, an
/// embedded `{id: ...}` object, or an array of either. Null clears edges.
fn edge_targets(field: &Field, value: &Value) -> Result<Vec<String>, AppError> {
    fn one(field: &Field, v: &Value) -> Result<String, AppError> {
        match v {
            Value::String(s) => Ok(s.clone()),
            Value::Object(map) => map
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    AppError::Validation(format!(
                        "relation value for '{}' has no id",
                        field.name
                    ))
                }),
            _ => Err(AppError::Validation(format!(
                "invalid relation value for '{}'",
                field.name
            ))),
        }
    }
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => {
            if !field.field_type.is_to_many() {
                return Err(AppError::Validation(format!(
                    "field '{}' holds a single reference",
                    field.name
                )));
            }
            items.iter().map(|v| one(field, v)).collect()
        }
        other => Ok(vec![one(field, other)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;
    use serde_json::json;

    fn relation_field(name: &str, field_type: FieldType) -> Field {
        Field {
            name: name.into(),
            title: None,
            field_type,
            ref_model: Some("part".into()),
            validation: None,
            order: 0,
        }
    }

    #[test]
    fn edge_targets_accepts_ids_and_embedded_objects() {
        let f = relation_field("engine", FieldType::OneToOne);
        assert_eq!(edge_targets(&f, &json!("abc")).ok(), Some(vec!["abc".to_string()]));
        assert_eq!(
            edge_targets(&f, &json!({"id": "abc", "name": "v8"})).ok(),
            Some(vec!["abc".to_string()])
        );
        assert_eq!(edge_targets(&f, &json!(null)).ok(), Some(vec![]));
    }

    #[test]
    fn arrays_require_a_to_many_field() {
        let single = relation_field("engine", FieldType::ManyToOne);
        assert!(edge_targets(&single, &json!(["a", "b"])).is_err());
        let many = relation_field("wheels", FieldType::OneToMany);
        assert_eq!(
            edge_targets(&many, &json!(["a", "b"])).ok(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn non_id_relation_values_are_rejected()  {
        let f = relation_field("engine", FieldType::OneToOne);
        assert!(edge_targets(&f, &json!(42)).is_err());
        assert!(edge_targets(&f, &json!({"name": "no id"})).is_err());
    }
}
