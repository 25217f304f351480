//! Query execution for models backed by third-party database tables.
//!
//! External models carry a connection URL, a table name, and logical-to-
//! physical column mappings. Only mapped columns are ever addressed; the
//! same declarative query shape compiles against the remote table and rows
//! come back keyed by local field names.

use crate::error::AppError;
use crate::model::{ExternalConfig, Model};
use crate::pg::{bind_params, decode_cell, row_to_value};
use crate::query::builder::aggregation_alias;
use crate::query::engine::rows_to_groups;
use crate::query::expr::{group_expr, safe_ident, Cast, FieldExpr, SqlBuf};
use crate::query::types::{FilterClause, GroupedResult, ObjectPage, QueryRequest, SortSpec};
use crate::query::ObjectQuerier;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Lazily-connected pools keyed by connection URL.
#[derive(Default)]
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, PgPool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        PoolRegistry::default()
    }

    pub async fn get(&self, url: &str) -> Result<PgPool, AppError> {
        if let Some(pool) = self.pools.read().await.get(url) {
            return Ok(pool.clone());
        }
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| AppError::ExternalPool(e.to_string()))?;
        let mut pools = self.pools.write().await;
        // A concurrent caller may have connected first; keep theirs.
        Ok(pools.entry(url.to_string()).or_insert(pool).clone())
    }

    pub async fn shutdown(&self) {
        let pools = self.pools.write().await;
        for pool in pools.values() {
            pool.close().await;
        }
    }
}

pub struct ExternalQueryService {
    pools: PoolRegistry,
}

impl ExternalQueryService {
    pub fn new(pools: PoolRegistry) -> Self {
        ExternalQueryService { pools }
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }
}

#[async_trait]
impl ObjectQuerier for ExternalQueryService {
    async fn list_objects(
        &self,
        model: &Model,
        req: &QueryRequest,
    ) -> Result<ObjectPage, AppError> {
        let ext = external_config(model)?;
        let list = build_external_list_query(ext, model, req)?;
        let pool = self.pools.get(&ext.url).await?;
        tracing::debug!(sql = %list.sql, params = ?list.params, table = %ext.table_name, "external list query");
        let rows = bind_params(sqlx::query(&list.sql), &list.params)
            .fetch_all(&pool)
            .await?;
        let data = rows.iter().map(row_to_value).collect();

        let count = build_external_count_query(ext, model, req)?;
        let row = bind_params(sqlx::query(&count.sql), &count.params)
            .fetch_one(&pool)
            .await?;
        let total = decode_cell(&row, "total").as_i64().unwrap_or(0);
        Ok(ObjectPage { data, count: total })
    }

    async fn find_grouped_objects(
        &self,
        model: &Model,
        req: &QueryRequest,
    ) -> Result<GroupedResult, AppError> {
        let ext = external_config(model)?;
        let q = build_external_grouped_query(ext, model, req)?;
        let pool = self.pools.get(&ext.url).await?;
        tracing::debug!(sql = %q.sql, params = ?q.params, table = %ext.table_name, "external grouped query");
        let rows = bind_params(sqlx::query(&q.sql), &q.params)
            .fetch_all(&pool)
            .await?;
        let values: Vec<Value> = rows.iter().map(row_to_value).collect();
        let agg_aliases: Vec<String> = req
            .aggregations
            .iter()
            .map(|(field, func)| aggregation_alias(field, func))
            .collect();
        let without_details = req.group_by.as_ref().map(|g| g.without_details).unwrap_or(false);
        Ok(rows_to_groups(
            values,
            req.pagination.limit() as i64,
            without_details,
            &agg_aliases,
        ))
    }
}

fn external_config(model: &Model) -> Result<&ExternalConfig, AppError> {
    model
        .external
        .as_ref()
        .ok_or_else(|| AppError::BadRequest(format!("model is not external: {}", model.name)))
}

/// Resolve a local field to its validated remote column. Returns None when
/// no mapping exists so callers can choose skip-or-error.
fn mapped_column<'a>(ext: &'a ExternalConfig, local: &str) -> Result<Option<&'a str>, AppError> {
    match ext.remote_column(local) {
        Some(remote) => Ok(Some(safe_ident(remote)?)),
        None => Ok(None),
    }
}

/// Resolve a field that must be mapped (group keys and sort keys).
fn required_column<'a>(ext: &'a ExternalConfig, local: &str) -> Result<&'a str, AppError> {
    mapped_column(ext, local)?.ok_or_else(|| AppError::UnmappedField(local.to_string()))
}

fn mapped_select(ext: &ExternalConfig) -> Result<String, AppError> {
    let mut cols = Vec::with_capacity(ext.mappings.len());
    for m in &ext.mappings {
        let remote = safe_ident(&m.remote)?;
        let local = safe_ident(&m.local)?;
        cols.push(format!("{} AS {}", remote, local));
    }
    if cols.is_empty() {
        return Err(AppError::Validation(
            "external model has no column mappings".into(),
        ));
    }
    Ok(cols.join(", "))
}

pub fn build_external_list_query(
    ext: &ExternalConfig,
    model: &Model,
    req: &QueryRequest,
) -> Result<SqlBuf, AppError> {
    if req.reference.is_some() {
        return Err(AppError::ExternalReference);
    }
    let table = safe_ident(&ext.table_name)?;
    let mut buf = SqlBuf::new();
    let where_clause = external_where(&mut buf, ext, model, req)?;
    let order = external_order(ext, req.object_sort.as_ref())?;
    buf.sql = format!(
        "SELECT {} FROM {} {} ORDER BY {} LIMIT {} OFFSET {}",
        mapped_select(ext)?,
        table,
        where_clause,
        order,
        req.pagination.limit(),
        req.pagination.offset()
    );
    Ok(buf)
}

pub fn build_external_count_query(
    ext: &ExternalConfig,
    model: &Model,
    req: &QueryRequest,
) -> Result<SqlBuf, AppError> {
    if req.reference.is_some() {
        return Err(AppError::ExternalReference);
    }
    let table = safe_ident(&ext.table_name)?;
    let mut buf = SqlBuf::new();
    let where_clause = external_where(&mut buf, ext, model, req)?;
    buf.sql = format!("SELECT COUNT(*) AS total FROM {} {}", table, where_clause);
    Ok(buf)
}

pub fn build_external_grouped_query(
    ext: &ExternalConfig,
    model: &Model,
    req: &QueryRequest,
) -> Result<SqlBuf, AppError> {
    if req.reference.is_some() {
        return Err(AppError::ExternalReference);
    }
    let group_by = req
        .group_by
        .as_ref()
        .ok_or_else(|| AppError::Validation("group_by is required for grouped queries".into()))?;
    let table = safe_ident(&ext.table_name)?;

    let mut buf = SqlBuf::new();
    let where_clause = external_where(&mut buf, ext, model, req)?;
    let group_col = required_column(ext, &group_by.field)?.to_string();
    let group = group_expr(&group_col, FieldExpr::Column, group_by.format.as_ref(), &mut buf)?;
    let order = external_order(ext, req.object_sort.as_ref())?;

    let mut select = vec![
        mapped_select(ext)?,
        format!("{} AS group_key", group),
        format!("COUNT(*) OVER (PARTITION BY {}) AS group_count", group),
        format!(
            "ROW_NUMBER() OVER (PARTITION BY {} ORDER BY {}) AS group_rank",
            group, order
        ),
    ];
    for (field, func) in &req.aggregations {
        let col = required_column(ext, field)?;
        let alias = aggregation_alias(field, func);
        let windowed = match func.as_str() {
            "count" => format!("COUNT({}) OVER (PARTITION BY {})", col, group),
            "sum" | "avg" | "min" | "max" => format!(
                "({}(CAST({} AS numeric)) OVER (PARTITION BY {}))::float8",
                func.to_uppercase(),
                col,
                group
            ),
            other => return Err(AppError::UnsupportedAggregation(other.to_string())),
        };
        select.push(format!("{} AS {}", windowed, alias));
    }

    let group_dir = req
        .group_sort
        .as_ref()
        .map(|s| s.direction)
        .unwrap_or_default();
    buf.sql = format!(
        "SELECT {} FROM {} {} ORDER BY group_key {} NULLS LAST, group_rank",
        select.join(", "),
        table,
        where_clause,
        group_dir.as_sql()
    );
    Ok(buf)
}

fn external_where(
    buf: &mut SqlBuf,
    ext: &ExternalConfig,
    model: &Model,
    req: &QueryRequest,
) -> Result<String, AppError> {
    let mut parts = Vec::new();
    for clause in &req.filters {
        let Some(col) = mapped_column(ext, &clause.field)? else {
            // Unmapped filters are skipped rather than failing the query.
            tracing::warn!(field = %clause.field, "skipping filter on unmapped external field");
            continue;
        };
        parts.push(external_predicate(buf, model, col, clause)?);
    }
    if parts.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!("WHERE {}", parts.join(" AND ")))
    }
}

fn external_predicate(
    buf: &mut SqlBuf,
    model: &Model,
    col: &str,
    clause: &FilterClause,
) -> Result<String, AppError> {
    use crate::query::expr::cast_for;
    let cast = cast_for(model.field(&clause.field).map(|f| &f.field_type), &clause.value);
    let predicate = match clause.operator.as_str() {
        "equals" => {
            let n = buf.push_param(clause.value.clone());
            format!("{} = {}", col, external_placeholder(n, cast))
        }
        "not" => {
            let n = buf.push_param(clause.value.clone());
            format!("{} IS DISTINCT FROM {}", col, external_placeholder(n, cast))
        }
        "string_contains" => {
            let n = buf.push_param(clause.value.clone());
            format!("({})::text LIKE '%' || ${} || '%'", col, n)
        }
        "string_starts_with" => {
            let n = buf.push_param(clause.value.clone());
            format!("({})::text LIKE ${} || '%'", col, n)
        }
        "string_ends_with" => {
            let n = buf.push_param(clause.value.clone());
            format!("({})::text LIKE '%' || ${}", col, n)
        }
        "gt" | "gte" | "lt" | "lte" => {
            let op = match clause.operator.as_str() {
                "gt" => ">",
                "gte" => ">=",
                "lt" => "<",
                _ => "<=",
            };
            let n = buf.push_param(clause.value.clone());
            format!("{} {} {}", col, op, external_placeholder(n, cast))
        }
        "between" => {
            let upper = clause
                .value2
                .clone()
                .ok_or_else(|| AppError::Validation("between requires value2".into()))?;
            let a = buf.push_param(clause.value.clone());
            let b = buf.push_param(upper);
            format!(
                "{} BETWEEN {} AND {}",
                col,
                external_placeholder(a, cast),
                external_placeholder(b, cast)
            )
        }
        "is_empty" => format!("{} IS NULL", col),
        "not_empty" => format!("{} IS NOT NULL", col),
        "array_contains" => {
            return Err(AppError::BadRequest(
                "array_contains is not supported on external models".into(),
            ))
        }
        other => return Err(AppError::UnsupportedOperator(other.to_string())),
    };
    Ok(predicate)
}

/// Native columns carry their own types; only date strings need help binding.
fn external_placeholder(n: usize, cast: Cast) -> String {
    match cast {
        Cast::Timestamp => format!("${}::timestamptz", n),
        _ => format!("${}", n),
    }
}

fn external_order(ext: &ExternalConfig, sort: Option<&SortSpec>) -> Result<String, AppError> {
    let Some(sort) = sort else {
        // Deterministic default: first mapped column.
        let first = ext
            .mappings
            .first()
            .ok_or_else(|| AppError::Validation("external model has no column mappings".into()))?;
        return Ok(format!("{} ASC", safe_ident(&first.remote)?));
    };
    let col = required_column(ext, &sort.field)?;
    Ok(format!("{} {}", col, sort.direction.as_sql()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnMapping, Field, FieldType};
    use crate::query::types::{Pagination, ReferenceFilter};
    use serde_json::json;

    fn external_model() -> Model {
        Model {
            name: "legacy_user".into(),
            title: None,
            description: None,
            fields: vec![Field {
                name: "age".into(),
                title: None,
                field_type: FieldType::Number,
                ref_model: None,
                validation: None,
                order: 0,
            }],
            external: Some(ExternalConfig {
                url: "postgres://external/db".into(),
                table_name: "users".into(),
                mappings: vec![
                    ColumnMapping { local: "name".into(), remote: "full_name".into() },
                    ColumnMapping { local: "age".into(), remote: "age_years".into() },
                ],
            }),
        }
    }

    fn base_request() -> QueryRequest {
        QueryRequest {
            model_name: "legacy_user".into(),
            pagination: Pagination::default(),
            reference: None,
            filters: vec![],
            group_by: None,
            aggregations: Default::default(),
            group_sort: None,
            object_sort: None,
        }
    }

    #[test]
    fn list_selects_remote_columns_under_local_names() {
        let model = external_model();
        let ext = model.external.as_ref().expect("external");
        let q = build_external_list_query(ext, &model, &base_request()).expect("builds");
        assert!(q.sql.starts_with("SELECT full_name AS name, age_years AS age FROM users"), "{}", q.sql);
    }

    #[test]
    fn unmapped_filter_is_skipped() {
        let model = external_model();
        let ext = model.external.as_ref().expect("external");
        let mut req = base_request();
        req.filters.push(FilterClause {
            field: "nickname".into(),
            operator: "equals".into(),
            value: json!("x"),
            value2: None,
        });
        let q = build_external_list_query(ext, &model, &req).expect("builds");
        assert!(!q.sql.contains("WHERE"), "{}", q.sql);
        assert!(q.params.is_empty());
    }

    #[test]
    fn mapped_filter_addresses_the_remote_column() {
        let model = external_model();
        let ext = model.external.as_ref().expect("external");
        let mut req = base_request();
        req.filters.push(FilterClause {
            field: "age".into(),
            operator: "gte".into(),
            value: json!(18),
            value2: None,
        });
        let q = build_external_list_query(ext, &model, &req).expect("builds");
        assert!(q.sql.contains("WHERE age_years >= $1"), "{}", q.sql);
        assert_eq!(q.params, vec![json!(18)]);
    }

    #[test]
    fn reference_filters_are_rejected() {
        let model = external_model();
        let ext = model.external.as_ref().expect("external");
        let mut req = base_request();
        req.reference = Some(ReferenceFilter {
            from_model_name: "team".into(),
            from_field_name: "members".into(),
            from_object_id: "t1".into(),
            to_model_name: "legacy_user".into(),
        });
        assert!(matches!(
            build_external_list_query(ext, &model, &req),
            Err(AppError::ExternalReference)
        ));
    }

    #[test]
    fn unmapped_group_key_is_an_error() {
        let model = external_model();
        let ext = model.external.as_ref().expect("external");
        let mut req = base_request();
        req.group_by = Some(crate::query::types::GroupBy {
            field: "nickname".into(),
            format: None,
            without_details: false,
        });
        assert!(matches!(
            build_external_grouped_query(ext, &model, &req),
            Err(AppError::UnmappedField(ref f)) if f == "nickname"
        ));
    }

    #[test]
    fn unsafe_remote_identifier_never_reaches_sql() {
        let mut model = external_model();
        if let Some(ext) = model.external.as_mut() {
            ext.mappings[0].remote = "full_name; DROP TABLE users".into();
        }
        let ext = model.external.as_ref().expect("external");
        assert!(matches!(
            build_external_list_query(ext, &model, &base_request()),
            Err(AppError::UnsafeIdentifier(_))
        ));
    }

    #[test]
    fn grouped_query_windows_over_the_remote_column() {
        let model = external_model();
        let ext = model.external.as_ref().expect("external");
        let mut req = base_request();
        req.group_by = Some(crate::query::types::GroupBy {
            field: "age".into(),
            format: None,
            without_details: false,
        });
        let q = build_external_grouped_query(ext, &model, &req).expect("builds");
        assert!(q.sql.contains("COUNT(*) OVER (PARTITION BY (age_years)::text) AS group_count"), "{}", q.sql);
    }
}
