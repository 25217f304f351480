//! Parameterized SQL assembly for the internal object store.
//!
//! Objects live in a schemaless `"values"` JSONB column keyed by a
//! `model_name` discriminator; references live in a uniform edge table.
//! Grouped queries compute group metadata and per-row rank in a single
//! SELECT with window functions.

use crate::error::AppError;
use crate::model::Model;
use crate::query::expr::{
    apply_cast, cast_for, group_expr, internal_field_expr, safe_ident, Cast, FieldExpr, SqlBuf,
};
use crate::query::types::{FilterClause, QueryRequest, ReferenceFilter, SortSpec};
use serde_json::Value;

/// Schema-qualified table names for the internal store.
#[derive(Clone, Debug)]
pub struct InternalTables {
    pub objects: String,
    pub references: String,
}

impl InternalTables {
    pub fn with_schema(schema: &str) -> Self {
        InternalTables {
            objects: format!("{}.objects", schema),
            references: format!("{}.object_references", schema),
        }
    }
}

const OBJECT_COLUMNS: &str = "id, model_name, \"values\", created_at, updated_at";

/// SELECT page of objects for one model with filters, reference constraint,
/// sort, and pagination.
pub fn build_list_query(
    tables: &InternalTables,
    model: &Model,
    req: &QueryRequest,
) -> Result<SqlBuf, AppError> {
    let mut buf = SqlBuf::new();
    let where_clause = where_clause(&mut buf, tables, model, req)?;
    let order = object_order(model, req.object_sort.as_ref())?;
    buf.sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT {} OFFSET {}",
        OBJECT_COLUMNS,
        tables.objects,
        where_clause,
        order,
        req.pagination.limit(),
        req.pagination.offset()
    );
    Ok(buf)
}

/// COUNT(*) with the same WHERE as the list query.
pub fn build_count_query(
    tables: &InternalTables,
    model: &Model,
    req: &QueryRequest,
) -> Result<SqlBuf, AppError> {
    let mut buf = SqlBuf::new();
    let where_clause = where_clause(&mut buf, tables, model, req)?;
    buf.sql = format!(
        "SELECT COUNT(*) AS total FROM {} WHERE {}",
        tables.objects, where_clause
    );
    Ok(buf)
}

/// One-round-trip grouped SELECT: every matching row annotated with its group
/// key, the group's count, its rank within the group, and any requested
/// aggregations, all via window functions over the same partition.
pub fn build_grouped_query(
    tables: &InternalTables,
    model: &Model,
    req: &QueryRequest,
) -> Result<SqlBuf, AppError> {
    let group_by = req
        .group_by
        .as_ref()
        .ok_or_else(|| AppError::Validation("group_by is required for grouped queries".into()))?;

    let mut buf = SqlBuf::new();
    let where_clause = where_clause(&mut buf, tables, model, req)?;

    let (base, kind) = internal_field_expr(&group_by.field)?;
    let group = group_expr(&base, kind, group_by.format.as_ref(), &mut buf)?;
    let object_order = object_order(model, req.object_sort.as_ref())?;

    let mut select = vec![
        OBJECT_COLUMNS.to_string(),
        format!("{} AS group_key", group),
        format!("COUNT(*) OVER (PARTITION BY {}) AS group_count", group),
        format!(
            "ROW_NUMBER() OVER (PARTITION BY {} ORDER BY {}) AS group_rank",
            group, object_order
        ),
    ];
    for (field, func) in &req.aggregations {
        select.push(aggregation_select(field, func, &group)?);
    }

    let group_dir = req
        .group_sort
        .as_ref()
        .map(|s| s.direction)
        .unwrap_or_default();
    buf.sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY group_key {} NULLS LAST, group_rank",
        select.join(", "),
        tables.objects,
        where_clause,
        group_dir.as_sql()
    );
    Ok(buf)
}

/// Alias used for an aggregation column in grouped SELECTs.
pub fn aggregation_alias(field: &str, func: &str) -> String {
    format!("agg_{}_{}", func, field.trim_start_matches("$$"))
}

fn aggregation_select(field: &str, func: &str, group: &str) -> Result<String, AppError> {
    let (expr, _) = internal_field_expr(field)?;
    let alias = aggregation_alias(field, func);
    let windowed = match func {
        "count" => format!("COUNT({}) OVER (PARTITION BY {})", expr, group),
        "sum" | "avg" | "min" | "max" => format!(
            "({}(CAST({} AS numeric)) OVER (PARTITION BY {}))::float8",
            func.to_uppercase(),
            expr,
            group
        ),
        other => return Err(AppError::UnsupportedAggregation(other.to_string())),
    };
    Ok(format!("{} AS {}", windowed, alias))
}

fn where_clause(
    buf: &mut SqlBuf,
    tables: &InternalTables,
    model: &Model,
    req: &QueryRequest,
) -> Result<String, AppError> {
    let n = buf.push_param(Value::String(model.name.clone()));
    let mut parts = vec![format!("model_name = ${}", n)];
    for clause in &req.filters {
        parts.push(filter_predicate(buf, model, clause)?);
    }
    if let Some(reference) = &req.reference {
        parts.push(reference_predicate(buf, tables, reference));
    }
    Ok(parts.join(" AND "))
}

/// Join through the edge table: objects referenced from one (model, field,
/// object) source.
fn reference_predicate(buf: &mut SqlBuf, tables: &InternalTables, r: &ReferenceFilter) -> String {
    let a = buf.push_param(Value::String(r.from_model_name.clone()));
    let b = buf.push_param(Value::String(r.from_field_name.clone()));
    let c = buf.push_param(Value::String(r.from_object_id.clone()));
    let d = buf.push_param(Value::String(r.to_model_name.clone()));
    format!(
        "id IN (SELECT r.to_object_id FROM {} r \
         WHERE r.from_model_name = ${} AND r.from_field_name = ${} \
         AND r.from_object_id = ${} AND r.to_model_name = ${})",
        tables.references, a, b, c, d
    )
}

fn filter_predicate(
    buf: &mut SqlBuf,
    model: &Model,
    clause: &FilterClause,
) -> Result<String, AppError> {
    let (expr, kind) = internal_field_expr(&clause.field)?;
    let field_type = model.field(&clause.field).map(|f| &f.field_type);

    let predicate = match clause.operator.as_str() {
        "equals" => comparison(buf, &expr, kind, field_type, "=", &clause.value),
        "not" => comparison(buf, &expr, kind, field_type, "IS DISTINCT FROM", &clause.value),
        "string_contains" => {
            let n = buf.push_param(clause.value.clone());
            format!("{} LIKE '%' || ${} || '%'", text_expr(&expr, kind), n)
        }
        "string_starts_with" => {
            let n = buf.push_param(clause.value.clone());
            format!("{} LIKE ${} || '%'", text_expr(&expr, kind), n)
        }
        "string_ends_with" => {
            let n = buf.push_param(clause.value.clone());
            format!("{} LIKE '%' || ${}", text_expr(&expr, kind), n)
        }
        "array_contains" => {
            if kind == FieldExpr::Column {
                return Err(AppError::BadRequest(
                    "array_contains is not supported on system fields".into(),
                ));
            }
            let encoded = clause.value.to_string();
            let name = safe_ident(&clause.field)?;
            let n = buf.push_param(Value::String(encoded));
            format!("\"values\"->'{}' @> ${}::jsonb", name, n)
        }
        "gt" | "gte" | "lt" | "lte" => {
            let op = match clause.operator.as_str() {
                "gt" => ">",
                "gte" => ">=",
                "lt" => "<",
                _ => "<=",
            };
            ordered_comparison(buf, &expr, kind, field_type, op, &clause.value)
        }
        "between" => {
            let upper = clause.value2.clone().ok_or_else(|| {
                AppError::Validation("between requires value2".into())
            })?;
            let cast = cast_for(field_type, &clause.value);
            let lhs = apply_cast(&expr, kind, cast);
            let a = buf.push_param(clause.value.clone());
            let b = buf.push_param(upper);
            format!(
                "{} BETWEEN {} AND {}",
                lhs,
                placeholder(a, kind, cast),
                placeholder(b, kind, cast)
            )
        }
        "is_empty" => match kind {
            FieldExpr::Column => format!("{} IS NULL", expr),
            FieldExpr::JsonText => format!("({} IS NULL OR {} = '')", expr, expr),
        },
        "not_empty" => match kind {
            FieldExpr::Column => format!("{} IS NOT NULL", expr),
            FieldExpr::JsonText => format!("({} IS NOT NULL AND {} <> '')", expr, expr),
        },
        other => return Err(AppError::UnsupportedOperator(other.to_string())),
    };
    Ok(predicate)
}

/// Equality-style comparison with type-aware casting so `"10"` and `10.0`
/// compare numerically on the string-typed JSON column.
fn comparison(
    buf: &mut SqlBuf,
    expr: &str,
    kind: FieldExpr,
    field_type: Option<&crate::model::FieldType>,
    op: &str,
    value: &Value,
) -> String {
    let cast = cast_for(field_type, value);
    let lhs = match (kind, value) {
        (FieldExpr::JsonText, Value::Bool(_)) => format!("({})::boolean", expr),
        _ => apply_cast(expr, kind, cast),
    };
    let n = buf.push_param(value.clone());
    format!("{} {} {}", lhs, op, placeholder(n, kind, cast))
}

fn ordered_comparison(
    buf: &mut SqlBuf,
    expr: &str,
    kind: FieldExpr,
    field_type: Option<&crate::model::FieldType>,
    op: &str,
    value: &Value,
) -> String {
    let cast = cast_for(field_type, value);
    let lhs = apply_cast(expr, kind, cast);
    let n = buf.push_param(value.clone());
    format!("{} {} {}", lhs, op, placeholder(n, kind, cast))
}

/// Placeholder with a cast when the left side is a native timestamp column,
/// so text parameters bind correctly.
fn placeholder(n: usize, kind: FieldExpr, cast: Cast) -> String {
    match (kind, cast) {
        (FieldExpr::Column, Cast::Timestamp) => format!("${}::timestamptz", n),
        (FieldExpr::JsonText, Cast::Timestamp) => format!("${}::timestamp", n),
        _ => format!("${}", n),
    }
}

fn text_expr(expr: &str, kind: FieldExpr) -> String {
    match kind {
        FieldExpr::Column => format!("({})::text", expr),
        FieldExpr::JsonText => expr.to_string(),
    }
}

fn object_order(model: &Model, sort: Option<&SortSpec>) -> Result<String, AppError> {
    let Some(sort) = sort else {
        return Ok("created_at ASC".to_string());
    };
    let (expr, kind) = internal_field_expr(&sort.field)?;
    let cast = cast_for(model.field(&sort.field).map(|f| &f.field_type), &Value::Null);
    Ok(format!(
        "{} {}",
        apply_cast(&expr, kind, cast),
        sort.direction.as_sql()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldType};
    use crate::query::types::{GroupBy, GroupFormat, Pagination};
    use serde_json::json;

    fn tables() -> InternalTables {
        InternalTables::with_schema("studio")
    }

    fn person() -> Model {
        Model {
            name: "person".into(),
            title: None,
            description: None,
            fields: vec![
                Field {
                    name: "name".into(),
                    title: None,
                    field_type: FieldType::String,
                    ref_model: None,
                    validation: None,
                    order: 0,
                },
                Field {
                    name: "age".into(),
                    title: None,
                    field_type: FieldType::Number,
                    ref_model: None,
                    validation: None,
                    order: 1,
                },
            ],
            external: None,
        }
    }

    fn base_request() -> QueryRequest {
        QueryRequest {
            model_name: "person".into(),
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
    fn list_query_filters_by_model_and_paginates() {
        let q = build_list_query(&tables(), &person(), &base_request()).expect("builds");
        assert_eq!(
            q.sql,
            "SELECT id, model_name, \"values\", created_at, updated_at FROM studio.objects \
             WHERE model_name = $1 ORDER BY created_at ASC LIMIT 20 OFFSET 0"
        );
        assert_eq!(q.params, vec![json!("person")]);
    }

    #[test]
    fn numeric_filter_casts_json_text() {
        let mut req = base_request();
        req.filters.push(FilterClause {
            field: "age".into(),
            operator: "gt".into(),
            value: json!(30),
            value2: None,
        });
        let q = build_list_query(&tables(), &person(), &req).expect("builds");
        assert!(q.sql.contains("(\"values\"->>'age')::numeric > $2"), "{}", q.sql);
        assert_eq!(q.params[1], json!(30));
    }

    #[test]
    fn unknown_operator_is_named_in_the_error() {
        let mut req = base_request();
        req.filters.push(FilterClause {
            field: "age".into(),
            operator: "fuzzy_match".into(),
            value: json!(1),
            value2: None,
        });
        let err = build_list_query(&tables(), &person(), &req).unwrap_err();
        assert!(matches!(err, AppError::UnsupportedOperator(ref op) if op == "fuzzy_match"));
    }

    #[test]
    fn between_requires_value2() {
        let mut req = base_request();
        req.filters.push(FilterClause {
            field: "age".into(),
            operator: "between".into(),
            value: json!(1),
            value2: None,
        });
        assert!(matches!(
            build_list_query(&tables(), &person(), &req),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn reference_constraint_joins_the_edge_table() {
        let mut req = base_request();
        req.reference = Some(ReferenceFilter {
            from_model_name: "team".into(),
            from_field_name: "members".into(),
            from_object_id: "t1".into(),
            to_model_name: "person".into(),
        });
        let q = build_list_query(&tables(), &person(), &req).expect("builds");
        assert!(q.sql.contains("id IN (SELECT r.to_object_id FROM studio.object_references r"));
        assert_eq!(
            q.params,
            vec![json!("person"), json!("team"), json!("members"), json!("t1"), json!("person")]
        );
    }

    #[test]
    fn grouped_query_uses_window_functions_over_one_partition() {
        let mut req = base_request();
        req.group_by = Some(GroupBy {
            field: "age".into(),
            format: Some(GroupFormat::Range { pattern: "0-30,31-60,60+".into() }),
            without_details: false,
        });
        req.aggregations.insert("age".into(), "avg".into());
        let q = build_grouped_query(&tables(), &person(), &req).expect("builds");
        assert!(q.sql.contains("COUNT(*) OVER (PARTITION BY CASE WHEN"), "{}", q.sql);
        assert!(q.sql.contains("ROW_NUMBER() OVER (PARTITION BY CASE WHEN"), "{}", q.sql);
        assert!(
            q.sql.contains("(AVG(CAST(\"values\"->>'age' AS numeric)) OVER (PARTITION BY CASE WHEN"),
            "{}",
            q.sql
        );
        assert!(q.sql.contains("AS agg_avg_age"), "{}", q.sql);
        assert!(q.sql.ends_with("ORDER BY group_key ASC NULLS LAST, group_rank"), "{}", q.sql);
        // model name + 3 segments x (bounds + label)
        assert_eq!(q.params[0], json!("person"));
        assert_eq!(q.params.len(), 9);
    }

    #[test]
    fn time_bucket_group_addresses_physical_column() {
        let mut req = base_request();
        req.group_by = Some(GroupBy {
            field: "$$createdAt".into(),
            format: Some(GroupFormat::Time { pattern: "YYYY-MM".into() }),
            without_details: true,
        });
        let q = build_grouped_query(&tables(), &person(), &req).expect("builds");
        assert!(q.sql.contains("TO_CHAR(created_at, 'YYYY-MM') AS group_key"), "{}", q.sql);
    }

    #[test]
    fn unknown_system_field_is_an_error() {
        let mut req = base_request();
        req.group_by = Some(GroupBy {
            field: "$$nope".into(),
            format: None,
            without_details: false,
        });
        assert!(matches!(
            build_grouped_query(&tables(), &person(), &req),
            Err(AppError::UnknownSystemField(_))
        ));
    }

    #[test]
    fn unsupported_aggregation_is_an_error() {
        let mut req = base_request();
        req.group_by = Some(GroupBy { field: "age".into(), format: None, without_details: false });
        req.aggregations.insert("age".into(), "median".into());
        assert!(matches!(
            build_grouped_query(&tables(), &person(), &req),
            Err(AppError::UnsupportedAggregation(ref f)) if f == "median"
        ));
    }
}
