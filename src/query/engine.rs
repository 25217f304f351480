//! Query execution against the internal object store.

use crate::error::AppError;
use crate::model::Model;
use crate::pg::{bind_params, decode_cell, row_to_value};
use crate::query::builder::{
    aggregation_alias, build_count_query, build_grouped_query, build_list_query, InternalTables,
};
use crate::query::tree::{build_full_tree, build_hierarchy_in_values, EdgeRow};
use crate::query::types::{GroupedResult, ObjectGroup, ObjectPage, QueryRequest};
use crate::query::ObjectQuerier;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::PgPool;

/// Traversal guard against reference cycles.
const MAX_TREE_DEPTH: i32 = 16;

pub struct QueryEngine {
    pool: PgPool,
    tables: InternalTables,
}

impl QueryEngine {
    pub fn new(pool: PgPool, tables: InternalTables) -> Self {
        QueryEngine { pool, tables }
    }

    /// All trees of a model: objects nobody references become roots, their
    /// reference closure nests beneath them as `children`.
    pub async fn full_tree(&self, model: &Model) -> Result<Vec<Value>, AppError> {
        let sql = format!(
            "WITH RECURSIVE tree AS ( \
               SELECT o.id, NULL::uuid AS parent_id, NULL::text AS field_name, 0 AS depth, \
                      o.model_name, o.\"values\", o.created_at, o.updated_at \
               FROM {objects} o \
               WHERE o.model_name = $1 \
                 AND NOT EXISTS (SELECT 1 FROM {refs} r WHERE r.to_object_id = o.id) \
               UNION ALL \
               SELECT c.id, r.from_object_id, r.from_field_name, t.depth + 1, \
                      c.model_name, c.\"values\", c.created_at, c.updated_at \
               FROM {refs} r \
               JOIN {objects} c ON c.id = r.to_object_id \
               JOIN tree t ON t.id = r.from_object_id \
               WHERE t.depth < {max_depth} \
             ) SELECT * FROM tree ORDER BY depth",
            objects = self.tables.objects,
            refs = self.tables.references,
            max_depth = MAX_TREE_DEPTH,
        );
        tracing::debug!(sql = %sql, model = %model.name, "full tree query");
        let rows = sqlx::query(&sql)
            .bind(&model.name)
            .fetch_all(&self.pool)
            .await?;
        let edges: Vec<EdgeRow> = rows.iter().map(edge_row).collect();
        Ok(build_full_tree(&edges))
    }

    /// One object with its whole reference closure embedded inside `values`.
    /// `first_level_fields`, when given, restricts which relation fields are
    /// followed from the root; deeper levels always follow everything.
    pub async fn deep_object(
        &self,
        model: &Model,
        object_id: &str,
        first_level_fields: Option<&[String]>,
    ) -> Result<Value, AppError> {
        let mut params: Vec<Value> = vec![
            Value::String(object_id.to_string()),
            Value::String(model.name.clone()),
        ];
        let field_gate = match first_level_fields {
            Some(fields) if !fields.is_empty() => {
                let mut placeholders = Vec::with_capacity(fields.len());
                for f in fields {
                    params.push(Value::String(f.clone()));
                    placeholders.push(format!("${}", params.len()));
                }
                format!(
                    "AND (t.depth > 0 OR r.from_field_name IN ({}))",
                    placeholders.join(", ")
                )
            }
            _ => String::new(),
        };
        let sql = format!(
            "WITH RECURSIVE tree AS ( \
               SELECT o.id, NULL::uuid AS parent_id, NULL::text AS field_name, 0 AS depth, \
                      o.model_name, o.\"values\", o.created_at, o.updated_at \
               FROM {objects} o \
               WHERE o.id = $1::uuid AND o.model_name = $2 \
               UNION ALL \
               SELECT c.id, r.from_object_id, r.from_field_name, t.depth + 1, \
                      c.model_name, c.\"values\", c.created_at, c.updated_at \
               FROM {refs} r \
               JOIN {objects} c ON c.id = r.to_object_id \
               JOIN tree t ON t.id = r.from_object_id \
               WHERE t.depth < {max_depth} {field_gate} \
             ) SELECT * FROM tree ORDER BY depth",
            objects = self.tables.objects,
            refs = self.tables.references,
            max_depth = MAX_TREE_DEPTH,
            field_gate = field_gate,
        );
        tracing::debug!(sql = %sql, object_id = %object_id, "deep object query");
        let rows = bind_params(sqlx::query(&sql), &params)
            .fetch_all(&self.pool)
            .await?;
        let edges: Vec<EdgeRow> = rows.iter().map(edge_row).collect();
        build_hierarchy_in_values(&edges).ok_or_else(|| {
            tracing::error!(object_id = %object_id, "no hierarchy root found");
            AppError::NotFound(format!("object not found: {}", object_id))
        })
    }
}

#[async_trait]
impl ObjectQuerier for QueryEngine {
    async fn list_objects(
        &self,
        model: &Model,
        req: &QueryRequest,
    ) -> Result<ObjectPage, AppError> {
        let list = build_list_query(&self.tables, model, req)?;
        tracing::debug!(sql = %list.sql, params = ?list.params, "list query");
        let rows = bind_params(sqlx::query(&list.sql), &list.params)
            .fetch_all(&self.pool)
            .await?;
        let data = rows.iter().map(row_to_value).collect();

        let count = build_count_query(&self.tables, model, req)?;
        let row = bind_params(sqlx::query(&count.sql), &count.params)
            .fetch_one(&self.pool)
            .await?;
        let total = decode_cell(&row, "total").as_i64().unwrap_or(0);
        Ok(ObjectPage { data, count: total })
    }

    async fn find_grouped_objects(
        &self,
        model: &Model,
        req: &QueryRequest,
    ) -> Result<GroupedResult, AppError> {
        let q = build_grouped_query(&self.tables, model, req)?;
        tracing::debug!(sql = %q.sql, params = ?q.params, "grouped query");
        let rows = bind_params(sqlx::query(&q.sql), &q.params)
            .fetch_all(&self.pool)
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

fn edge_row(row: &PgRow) -> EdgeRow {
    let id = decode_cell(row, "id").as_str().unwrap_or_default().to_string();
    let parent_id = decode_cell(row, "parent_id").as_str().map(str::to_string);
    let field_name = decode_cell(row, "field_name").as_str().map(str::to_string);
    let depth = decode_cell(row, "depth").as_i64().unwrap_or(0) as i32;
    let mut object = Map::new();
    for col in ["id", "model_name", "values", "created_at", "updated_at"] {
        object.insert(col.to_string(), decode_cell(row, col));
    }
    EdgeRow {
        id,
        parent_id,
        field_name,
        object: Value::Object(object),
        depth,
    }
}

/// Reshape flat windowed rows into groups. Rows arrive ordered by group key
/// then rank; the first row of each group carries the group's count and
/// aggregations, `page_size` caps how many objects each group materializes.
pub fn rows_to_groups(
    rows: Vec<Value>,
    page_size: i64,
    without_details: bool,
    agg_aliases: &[String],
) -> GroupedResult {
    let mut groups: Vec<ObjectGroup> = Vec::new();
    let mut total_count: i64 = 0;
    for row in rows {
        let Value::Object(mut row) = row else { continue };
        let key = match row.remove("group_key") {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => "null".to_string(),
            Some(other) => other.to_string(),
        };
        let count = row.remove("group_count").and_then(|v| v.as_i64()).unwrap_or(0);
        let rank = row.remove("group_rank").and_then(|v| v.as_i64()).unwrap_or(0);
        let mut aggregations = Map::new();
        for alias in agg_aliases {
            if let Some(v) = row.remove(alias) {
                let name = alias.strip_prefix("agg_").unwrap_or(alias);
                aggregations.insert(name.to_string(), v);
            }
        }

        let is_new_group = groups.last().map(|g| g.key != key).unwrap_or(true);
        if is_new_group {
            total_count += count;
            groups.push(ObjectGroup {
                key,
                count,
                objects: if without_details { None } else { Some(Vec::new()) },
                aggregations: if aggregations.is_empty() {
                    None
                } else {
                    Some(aggregations)
                },
            });
        }
        if without_details || rank > page_size {
            continue;
        }
        if let Some(group) = groups.last_mut() {
            if let Some(objects) = group.objects.as_mut() {
                objects.push(Value::Object(row));
            }
        }
    }
    GroupedResult {
        groups,
        total_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grouped_row(key: Option<&str>, count: i64, rank: i64, id: &str) -> Value {
        json!({
            "group_key": key,
            "group_count": count,
            "group_rank": rank,
            "id": id,
            "model_name": "person",
            "values": {"name": id},
        })
    }

    #[test]
    fn age_ranges_reshape_into_three_groups() {
        // ages 10, 25, 35, 45, 70 bucketed by 0-30,31-60,60+
        let rows = vec![
            grouped_row(Some("0-30"), 2, 1, "p10"),
            grouped_row(Some("0-30"), 2, 2, "p25"),
            grouped_row(Some("31-60"), 2, 1, "p35"),
            grouped_row(Some("31-60"), 2, 2, "p45"),
            grouped_row(Some("60+"), 1, 1, "p70"),
        ];
        let result = rows_to_groups(rows, 20, false, &[]);
        assert_eq!(result.total_count, 5);
        assert_eq!(result.groups.len(), 3);
        let counts: Vec<i64> = result.groups.iter().map(|g| g.count).collect();
        assert_eq!(counts, vec![2, 2, 1]);
        let first = &result.groups[0];
        assert_eq!(first.key, "0-30");
        assert_eq!(first.objects.as_ref().map(|o| o.len()), Some(2));
        assert!(first.objects.as_ref().and_then(|o| o[0].get("group_key")).is_none());
    }

    #[test]
    fn rank_beyond_page_size_is_not_materialized() {
        let rows = vec![
            grouped_row(Some("a"), 3, 1, "x1"),
            grouped_row(Some("a"), 3, 2, "x2"),
            grouped_row(Some("a"), 3, 3, "x3"),
        ];
        let result = rows_to_groups(rows, 2, false, &[]);
        assert_eq!(result.groups[0].count, 3);
        assert_eq!(result.groups[0].objects.as_ref().map(|o| o.len()), Some(2));
    }

    #[test]
    fn without_details_drops_objects_but_keeps_counts() {
        let rows = vec![
            grouped_row(Some("a"), 2, 1, "x1"),
            grouped_row(Some("a"), 2, 2, "x2"),
        ];
        let result = rows_to_groups(rows, 20, true, &[]);
        assert_eq!(result.groups[0].count, 2);
        assert!(result.groups[0].objects.is_none());
    }

    #[test]
    fn null_group_key_becomes_the_null_bucket() {
        let rows = vec![grouped_row(None, 1, 1, "x1")];
        let result = rows_to_groups(rows, 20, false, &[]);
        assert_eq!(result.groups[0].key, "null");
    }

    #[test]
    fn aggregation_columns_move_onto_the_group() {
        let mut row = grouped_row(Some("a"), 1, 1, "x1");
        row.as_object_mut()
            .expect("object")
            .insert("agg_avg_age".into(), json!(31.5));
        let result = rows_to_groups(vec![row], 20, false, &["agg_avg_age".to_string()]);
        let aggs = result.groups[0].aggregations.as_ref().expect("aggs");
        assert_eq!(aggs.get("avg_age"), Some(&json!(31.5)));
        assert!(result.groups[0].objects.as_ref().map(|o| &o[0]).and_then(|o| o.get("agg_avg_age")).is_none());
    }
}
