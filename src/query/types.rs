//! Declarative query description and the uniform result shapes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Pagination {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Pagination {
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl Pagination {
    pub fn limit(&self) -> u32 {
        self.page_size.clamp(1, 1000)
    }

    /// Computed in u64 so large page numbers cannot overflow.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit())
    }
}

/// Constrain results to objects referenced from one source object through one
/// relation field.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReferenceFilter {
    pub from_model_name: String,
    pub from_field_name: String,
    pub from_object_id: String,
    pub to_model_name: String,
}

/// One AND-ed filter clause. The operator is carried as a string and
/// validated where the SQL is built, so an unknown operator fails with a
/// message naming it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FilterClause {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
    /// Upper bound for `between`.
    #[serde(default)]
    pub value2: Option<Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GroupFormat {
    /// Calendar bucketing: pattern is `YYYY`, `YYYY-MM`, or `YYYY-MM-DD`.
    Time { pattern: String },
    /// Numeric bucketing: comma-separated `min-max`, `min+`, or exact-value
    /// segments, e.g. `0-30,31-60,60+`.
    Range { pattern: String },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GroupBy {
    pub field: String,
    #[serde(default)]
    pub format: Option<GroupFormat>,
    /// Return counts/aggregations only, no per-object materialization.
    #[serde(default)]
    pub without_details: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QueryRequest {
    pub model_name: String,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default)]
    pub reference: Option<ReferenceFilter>,
    #[serde(default)]
    pub filters: Vec<FilterClause>,
    #[serde(default)]
    pub group_by: Option<GroupBy>,
    /// field -> aggregation name (count|sum|avg|min|max). Names are validated
    /// where the SQL is built.
    #[serde(default)]
    pub aggregations: BTreeMap<String, String>,
    #[serde(default)]
    pub group_sort: Option<SortSpec>,
    #[serde(default)]
    pub object_sort: Option<SortSpec>,
}

/// Paginated list result.
#[derive(Clone, Debug, Serialize)]
pub struct ObjectPage {
    pub data: Vec<Value>,
    pub count: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ObjectGroup {
    pub key: String,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objects: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<Map<String, Value>>,
}

/// Grouped result; `total_count` is the sum of per-group counts, not a
/// separate query.
#[derive(Clone, Debug, Serialize)]
pub struct GroupedResult {
    pub groups: Vec<ObjectGroup>,
    pub total_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_clamps_and_offsets() {
        let p = Pagination { page: 3, page_size: 50 };
        assert_eq!(p.limit(), 50);
        assert_eq!(p.offset(), 100);
        let zero = Pagination { page: 0, page_size: 0 };
        assert_eq!(zero.limit(), 1);
        assert_eq!(zero.offset(), 0);
    }

    #[test]
    fn huge_page_numbers_do_not_overflow() {
        let p = Pagination { page: u32::MAX, page_size: 1000 };
        assert_eq!(p.offset(), u64::from(u32::MAX - 1) * 1000);
    }
}
