//! Studio persistence: _sys_* table DDL, versioned config replacement, and
//! the save endpoint's payload types. All studio tables live in a schema
//! named from `STUDIO_SCHEMA` env (default `studio`).

use crate::error::{AppError, ConfigError};
use crate::model::{validate, Model, View};
use sqlx::ConnectOptions;
use sqlx::PgPool;
use std::str::FromStr;

/// Schema name for studio tables. From env `STUDIO_SCHEMA`, default `studio`.
/// Must be a valid PostgreSQL identifier.
pub fn studio_schema() -> String {
    std::env::var("STUDIO_SCHEMA").unwrap_or_else(|_| "studio".into())
}

/// Returns the schema-qualified name for a studio table (e.g. "studio._sys_models").
pub fn qualified_sys_table(table: &str) -> String {
    format!("{}.{}", studio_schema(), table)
}

/// Config tables, each row keyed by entity name with a JSONB payload.
const CONFIG_TABLES: &[&str] = &["_sys_models", "_sys_views"];

/// Create the studio schema if missing, then the config, object, and
/// reference tables.
pub async fn ensure_sys_tables(pool: &PgPool) -> Result<(), AppError> {
    let schema = studio_schema();
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(pool)
        .await?;

    for table in CONFIG_TABLES {
        let q_table = qualified_sys_table(table);
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                payload JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                version BIGINT NOT NULL DEFAULT 1
            )
            "#,
            q_table
        );
        sqlx::query(&ddl).execute(pool).await?;

        let history_table = qualified_sys_table(&format!("{}_history", table));
        let history_ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT NOT NULL,
                payload JSONB NOT NULL,
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (id, version)
            )
            "#,
            history_table
        );
        sqlx::query(&history_ddl).execute(pool).await?;
    }

    let q_objects = format!("{}.objects", schema);
    let objects_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            model_name TEXT NOT NULL,
            "values" JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        q_objects
    );
    sqlx::query(&objects_ddl).execute(pool).await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS objects_model_name_idx ON {} (model_name)",
        q_objects
    ))
    .execute(pool)
    .await?;

    let q_refs = format!("{}.object_references", schema);
    let refs_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            from_model_name TEXT NOT NULL,
            from_field_name TEXT NOT NULL,
            from_object_id UUID NOT NULL,
            to_model_name TEXT NOT NULL,
            to_object_id UUID NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (from_object_id, from_field_name, to_object_id)
        )
        "#,
        q_refs
    );
    sqlx::query(&refs_ddl).execute(pool).await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS object_references_to_idx ON {} (to_object_id)",
        q_refs
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS object_references_from_idx ON {} (from_model_name, from_field_name, from_object_id)",
        q_refs
    ))
    .execute(pool)
    .await?;

    Ok(())
}

fn config_record_id(rec: &serde_json::Value) -> Result<String, AppError> {
    rec.get("name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest("each config record must have a 'name' field".into()))
}

/// Upsert one config row by name: if an identical payload is already stored,
/// nothing happens and the current version is returned; otherwise the current
/// row (if any) is copied to history and the row is rewritten with version+1.
/// Returns (whether a write happened, resulting version). Call within a
/// transaction for atomicity.
pub async fn upsert_config_row(
    tx: &mut sqlx::PgConnection,
    table: &str,
    id: &str,
    payload: &serde_json::Value,
) -> Result<(bool, i64), AppError> {
    let q_table = qualified_sys_table(table);
    let current: Option<(serde_json::Value, i64)> = sqlx::query_as(&format!(
        "SELECT payload, version FROM {} WHERE id = $1",
        q_table
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(AppError::Db)?;

    let new_version = match &current {
        Some((existing, version)) if existing == payload => return Ok((false, *version)),
        Some((_, version)) => version + 1,
        None => 1,
    };

    if let Some((old_payload, old_version)) = current {
        let history_table = qualified_sys_table(&format!("{}_history", table));
        sqlx::query(&format!(
            "INSERT INTO {} (id, payload, version, created_at) VALUES ($1, $2, $3, NOW())",
            history_table
        ))
        .bind(id)
        .bind(old_payload)
        .bind(old_version)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", q_table))
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(&format!(
        "INSERT INTO {} (id, payload, updated_at, version) VALUES ($1, $2, NOW(), $3)",
        q_table
    ))
    .bind(id)
    .bind(payload)
    .bind(new_version)
    .execute(&mut *tx)
    .await?;
    Ok((true, new_version))
}

/// Payload of the studio save endpoint: one editing session's model and its
/// views. The underscore-prefixed fields carry the client's change ledger and
/// are logged, not persisted.
#[derive(Debug, serde::Deserialize)]
pub struct SaveRequest {
    #[serde(default)]
    pub model: Option<serde_json::Value>,
    #[serde(default)]
    pub views: Vec<serde_json::Value>,
    #[serde(default, rename = "_incremental_changes")]
    pub incremental_changes: Option<serde_json::Value>,
    #[serde(default, rename = "_changes_summary")]
    pub changes_summary: Option<String>,
    #[serde(default, rename = "_is_incremental")]
    pub is_incremental: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct SaveResult {
    pub models_saved: u64,
    pub views_saved: u64,
    pub views_deleted: u64,
}

impl SaveResult {
    pub fn wrote_anything(&self) -> bool {
        self.models_saved > 0 || self.views_saved > 0 || self.views_deleted > 0
    }
}

/// Validate and persist one studio editing session's configuration. The
/// incoming model is validated against the full stored model set (relations
/// may target models outside this session); views for the session's model
/// that are absent from the payload are removed.
pub async fn save_studio_config(pool: &PgPool, req: &SaveRequest) -> Result<SaveResult, AppError> {
    let incoming_model: Option<Model> = req.model.as_ref().map(parse_payload).transpose()?;
    let views: Vec<View> = req.views.iter().map(parse_payload).collect::<Result<_, _>>()?;

    let mut all_models = load_stored_models(pool).await?;
    if let Some(model) = &incoming_model {
        all_models.retain(|m| m.name != model.name);
        all_models.push(model.clone());
    }
    validate(&all_models, &views)?;

    if req.is_incremental {
        if let Some(summary) = &req.changes_summary {
            tracing::info!(summary = %summary, "incremental studio save");
        }
        if let Some(changes) = &req.incremental_changes {
            tracing::debug!(changes = %changes, "incremental change ledger");
        }
    }

    let mut tx = pool.begin().await?;
    let mut result = SaveResult {
        models_saved: 0,
        views_saved: 0,
        views_deleted: 0,
    };
    if let Some(payload) = &req.model {
        let id = config_record_id(payload)?;
        let (wrote, _) = upsert_config_row(&mut tx, "_sys_models", &id, payload).await?;
        if wrote {
            result.models_saved += 1;
        }
    }
    let mut view_names = Vec::with_capacity(req.views.len());
    for payload in &req.views {
        let id = config_record_id(payload)?;
        let (wrote, _) = upsert_config_row(&mut tx, "_sys_views", &id, payload).await?;
        if wrote {
            result.views_saved += 1;
        }
        view_names.push(id);
    }
    if let Some(model) = &incoming_model {
        result.views_deleted =
            delete_stale_views(&mut tx, &model.name, &view_names).await?;
    }
    tx.commit().await?;
    tracing::info!(
        models_saved = result.models_saved,
        views_saved = result.views_saved,
        views_deleted = result.views_deleted,
        "studio config saved"
    );
    Ok(result)
}

/// Remove stored views of one model that the session no longer carries.
async fn delete_stale_views(
    tx: &mut sqlx::PgConnection,
    model_name: &str,
    keep: &[String],
) -> Result<u64, AppError> {
    let q_views = qualified_sys_table("_sys_views");
    let result = sqlx::query(&format!(
        "DELETE FROM {} WHERE payload->>'model_name' = $1 AND NOT (id = ANY($2))",
        q_views
    ))
    .bind(model_name)
    .bind(keep)
    .execute(&mut *tx)
    .await?;
    Ok(result.rows_affected())
}

async fn load_stored_models(pool: &PgPool) -> Result<Vec<Model>, AppError> {
    let q_models = qualified_sys_table("_sys_models");
    let rows = sqlx::query_scalar::<_, serde_json::Value>(&format!(
        "SELECT payload FROM {} ORDER BY id",
        q_models
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(parse_payload).collect()
}

fn parse_payload<T>(rec: &serde_json::Value) -> Result<T, AppError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    serde_json::from_value(rec.clone())
        .map_err(|e| AppError::Config(ConfigError::Load(e.to_string())))
}

/// Ensure the database in `database_url` exists; create it if not. Connects to
/// the default `postgres` database to run CREATE DATABASE. Call before
/// creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| AppError::BadRequest(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await.map_err(AppError::Db)?;
    let exists: (bool,) =
        sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&db_name)
            .fetch_one(&mut conn)
            .await
            .map_err(AppError::Db)?;
    if !exists.0 {
        let quoted = quote_ident(&db_name);
        sqlx::query(&format!("CREATE DATABASE {}", quoted))
            .execute(&mut conn)
            .await
            .map_err(AppError::Db)?;
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), AppError> {
    let path_start = url
        .rfind('/')
        .ok_or_else(|| AppError::BadRequest("DATABASE_URL: no path".into()))?
        + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    let admin_url = format!("{}postgres", base);
    Ok((admin_url, db_name.to_string()))
}

// Embedded double quotes are escaped by doubling, per PostgreSQL quoting rules.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_without_a_name_are_rejected() {
        assert!(config_record_id(&json!({"title": "x"})).is_err());
        assert_eq!(config_record_id(&json!({"name": "person"})).ok(), Some("person".into()));
    }

    #[test]
    fn save_request_reads_underscore_fields() {
        let req: SaveRequest = serde_json::from_value(json!({
            "model": {"name": "person"},
            "views": [],
            "_is_incremental": true,
            "_changes_summary": "2 changes",
        }))
        .expect("parses");
        assert!(req.is_incremental);
        assert_eq!(req.changes_summary.as_deref(), Some("2 changes"));
        assert!(req.model.is_some());
    }

    #[test]
    fn malformed_model_payload_fails_typed_parse() {
        let res: Result<crate::model::Model, _> =
            parse_payload(&json!({"name": "person", "fields": [{"name": "age"}]}));
        // Field without a type does not parse.
        assert!(res.is_err());
        let ok: Result<crate::model::Model, _> = parse_payload(&json!({
            "name": "person",
            "fields": [{"name": "age", "type": "number"}]
        }));
        assert!(ok.is_ok());
    }

    #[test]
    fn quoted_identifiers_double_embedded_quotes() {
        assert_eq!(quote_ident("studio_db"), "\"studio_db\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
        assert_eq!(quote_ident("back\\slash"), "\"back\\slash\"");
    }

    #[test]
    fn db_name_parsing() {
        let (admin, name) =
            parse_db_name_from_url("postgres://u:p@localhost:5432/studio_db?sslmode=disable")
                .expect("parses");
        assert_eq!(name, "studio_db");
        assert_eq!(admin, "postgres://u:p@localhost:5432/postgres");
    }
}
