//! SQL expression building blocks shared by the internal and external paths:
//! the parameter accumulator, the identifier gate, field expressions, casts,
//! and the time/range group-expression compilers.

use crate::error::AppError;
use crate::model::FieldType;
use crate::query::types::GroupFormat;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Clause text plus positional parameters, bound in order. Identifiers are
/// validated before interpolation; values only ever enter as parameters.
#[derive(Debug, Default)]
pub struct SqlBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlBuf {
    pub fn new() -> Self {
        SqlBuf::default()
    }

    /// Returns the 1-based placeholder number for the pushed value.
    pub fn push_param(&mut self, v: Value) -> usize {
        self.params.push(v);
        self.params.len()
    }
}

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[_a-zA-Z][_a-zA-Z0-9]*$").expect("static regex"))
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}").expect("static regex"))
}

/// The single gate through which raw identifiers enter SQL text. Everything
/// else is parameterized.
pub fn safe_ident(name: &str) -> Result<&str, AppError> {
    if ident_re().is_match(name) {
        Ok(name)
    } else {
        Err(AppError::UnsafeIdentifier(name.to_string()))
    }
}

/// Physical column addressed by a `$$` pseudo-field on the internal store.
pub fn system_column(field: &str) -> Result<&'static str, AppError> {
    match field {
        "$$id" => Ok("id"),
        "$$createdAt" => Ok("created_at"),
        "$$updatedAt" => Ok("updated_at"),
        "$$modelName" => Ok("model_name"),
        other => Err(AppError::UnknownSystemField(other.to_string())),
    }
}

/// How a field expression reaches SQL on the internal path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldExpr {
    /// A physical table column (system pseudo-field).
    Column,
    /// `"values"->>'name'`: always text, casts applied as needed.
    JsonText,
}

/// Resolve an internal-path field to its SQL expression. `$$`-prefixed names
/// address physical columns; everything else addresses the JSON values bag.
pub fn internal_field_expr(field: &str) -> Result<(String, FieldExpr), AppError> {
    if field.starts_with("$$") {
        let col = system_column(field)?;
        Ok((col.to_string(), FieldExpr::Column))
    } else {
        let name = safe_ident(field)?;
        Ok((format!("\"values\"->>'{}'", name), FieldExpr::JsonText))
    }
}

/// Cast applied to a text-typed expression for correct ordering semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cast {
    None,
    Numeric,
    Timestamp,
}

/// Pick the comparison cast from the declared field type, falling back to a
/// date-string heuristic and then the value's JSON type.
pub fn cast_for(field_type: Option<&FieldType>, sample: &Value) -> Cast {
    match field_type {
        Some(FieldType::Number) => return Cast::Numeric,
        Some(FieldType::Date) => return Cast::Timestamp,
        Some(_) => {}
        None => {}
    }
    match sample {
        Value::Number(_) => Cast::Numeric,
        Value::String(s) if date_re().is_match(s) => Cast::Timestamp,
        _ => Cast::None,
    }
}

pub fn apply_cast(expr: &str, kind: FieldExpr, cast: Cast) -> String {
    // Physical columns already carry their native types.
    if kind == FieldExpr::Column {
        return expr.to_string();
    }
    match cast {
        Cast::None => expr.to_string(),
        Cast::Numeric => format!("({})::numeric", expr),
        Cast::Timestamp => format!("({})::timestamp", expr),
    }
}

/// Compile a calendar bucketing expression over a timestamp expression.
pub fn time_bucket_expr(ts_expr: &str, pattern: &str) -> Result<String, AppError> {
    match pattern {
        "YYYY" => Ok(format!("EXTRACT(YEAR FROM {})::text", ts_expr)),
        "YYYY-MM" => Ok(format!("TO_CHAR({}, 'YYYY-MM')", ts_expr)),
        "YYYY-MM-DD" => Ok(format!("TO_CHAR({}, 'YYYY-MM-DD')", ts_expr)),
        other => Err(AppError::Validation(format!(
            "unsupported time bucket pattern: {}",
            other
        ))),
    }
}

/// Compile the `min-max,min+,val` mini-language into a CASE expression over a
/// numeric expression. Bounds and labels are parameterized; unmatched values
/// fall into the 'other' bucket.
pub fn range_bucket_expr(
    num_expr: &str,
    pattern: &str,
    buf: &mut SqlBuf,
) -> Result<String, AppError> {
    let mut arms = Vec::new();
    for segment in pattern.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let arm = if let Some(min) = segment.strip_suffix('+') {
            let min = parse_bound(segment, min)?;
            let n = buf.push_param(min);
            let lab = buf.push_param(Value::String(segment.to_string()));
            format!("WHEN {} >= ${} THEN ${}", num_expr, n, lab)
        } else if let Some((min, max)) = segment.split_once('-') {
            let min = parse_bound(segment, min)?;
            let max = parse_bound(segment, max)?;
            let a = buf.push_param(min);
            let b = buf.push_param(max);
            let lab = buf.push_param(Value::String(segment.to_string()));
            format!("WHEN {} BETWEEN ${} AND ${} THEN ${}", num_expr, a, b, lab)
        } else {
            let v = parse_bound(segment, segment)?;
            let n = buf.push_param(v);
            let lab = buf.push_param(Value::String(segment.to_string()));
            format!("WHEN {} = ${} THEN ${}", num_expr, n, lab)
        };
        arms.push(arm);
    }
    if arms.is_empty() {
        return Err(AppError::Validation(format!(
            "empty range pattern: {}",
            pattern
        )));
    }
    Ok(format!("CASE {} ELSE 'other' END", arms.join(" ")))
}

fn parse_bound(segment: &str, raw: &str) -> Result<Value, AppError> {
    let n: f64 = raw.trim().parse().map_err(|_| {
        AppError::Validation(format!("invalid range segment: {}", segment))
    })?;
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| AppError::Validation(format!("invalid range segment: {}", segment)))
}

/// Compile the group expression for a group-by field, given its base SQL
/// expression and kind.
pub fn group_expr(
    base: &str,
    kind: FieldExpr,
    format: Option<&GroupFormat>,
    buf: &mut SqlBuf,
) -> Result<String, AppError> {
    match format {
        None => match kind {
            FieldExpr::Column => Ok(format!("({})::text", base)),
            FieldExpr::JsonText => Ok(base.to_string()),
        },
        Some(GroupFormat::Time { pattern }) => {
            let ts = match kind {
                FieldExpr::Column => base.to_string(),
                FieldExpr::JsonText => format!("({})::timestamp", base),
            };
            time_bucket_expr(&ts, pattern)
        }
        Some(GroupFormat::Range { pattern }) => {
            let num = match kind {
                FieldExpr::Column => base.to_string(),
                FieldExpr::JsonText => format!("({})::numeric", base),
            };
            range_bucket_expr(&num, pattern, buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ident_gate_rejects_unsafe_names() {
        assert!(safe_ident("age").is_ok());
        assert!(safe_ident("_private2").is_ok());
        for bad in ["age; DROP TABLE t", "a-b", "1abc", "a b", "", "col\"'"] {
            assert!(matches!(safe_ident(bad), Err(AppError::UnsafeIdentifier(_))), "{}", bad);
        }
    }

    #[test]
    fn system_fields_map_to_physical_columns() {
        assert_eq!(system_column("$$createdAt").ok(), Some("created_at"));
        assert!(matches!(
            system_column("$$bogus"),
            Err(AppError::UnknownSystemField(_))
        ));
    }

    #[test]
    fn cast_prefers_declared_type_then_heuristic() {
        assert_eq!(cast_for(Some(&FieldType::Number), &json!("x")), Cast::Numeric);
        assert_eq!(cast_for(Some(&FieldType::Date), &json!(1)), Cast::Timestamp);
        assert_eq!(cast_for(None, &json!(5)), Cast::Numeric);
        assert_eq!(cast_for(None, &json!("2024-01-15")), Cast::Timestamp);
        assert_eq!(cast_for(None, &json!("hello")), Cast::None);
    }

    #[test]
    fn time_buckets() {
        assert_eq!(
            time_bucket_expr("created_at", "YYYY").ok().as_deref(),
            Some("EXTRACT(YEAR FROM created_at)::text")
        );
        assert_eq!(
            time_bucket_expr("created_at", "YYYY-MM").ok().as_deref(),
            Some("TO_CHAR(created_at, 'YYYY-MM')")
        );
        assert!(time_bucket_expr("created_at", "HH24").is_err());
    }

    #[test]
    fn range_pattern_compiles_to_parameterized_case() {
        let mut buf = SqlBuf::new();
        let expr = range_bucket_expr("(\"values\"->>'age')::numeric", "0-30,31-60,60+", &mut buf)
            .expect("compiles");
        assert_eq!(
            expr,
            "CASE WHEN (\"values\"->>'age')::numeric BETWEEN $1 AND $2 THEN $3 \
             WHEN (\"values\"->>'age')::numeric BETWEEN $4 AND $5 THEN $6 \
             WHEN (\"values\"->>'age')::numeric >= $7 THEN $8 ELSE 'other' END"
        );
        assert_eq!(
            buf.params,
            vec![
                json!(0.0),
                json!(30.0),
                json!("0-30"),
                json!(31.0),
                json!(60.0),
                json!("31-60"),
                json!(60.0),
                json!("60+")
            ]
        );
    }

    #[test]
    fn range_pattern_exact_value_segment() {
        let mut buf = SqlBuf::new();
        let expr = range_bucket_expr("x", "42", &mut buf).expect("compiles");
        assert_eq!(expr, "CASE WHEN x = $1 THEN $2 ELSE 'other' END");
    }

    #[test]
    fn malformed_range_segment_is_an_error() {
        let mut buf = SqlBuf::new();
        assert!(range_bucket_expr("x", "a-b", &mut buf).is_err());
        assert!(range_bucket_expr("x", "", &mut buf).is_err());
    }
}
