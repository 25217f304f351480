//! Snapshot comparison: classified, risk-scored change items for the save
//! confirmation dialog.
//!
//! Operates on fully-materialized before/after snapshots, independent of the
//! incremental ledger, so it stays correct even when a caller bypasses the
//! change-tracking store.

use crate::data::deep_eq;
use crate::studio::changes::IncrementalChanges;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Comparison input; distinct from OriginalData/RuntimeData and not
/// change-tracked itself.
#[derive(Clone, Debug)]
pub struct ConfigSnapshot {
    pub model: Option<Value>,
    pub views: Vec<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ConfigSnapshot {
    pub fn new(model: Option<Value>, views: Vec<Value>) -> Self {
        ConfigSnapshot {
            model,
            views,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, Serialize)]
pub struct PropertyChange {
    pub property: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// Read-only once created; consumed by the confirmation dialog.
#[derive(Clone, Debug, Serialize)]
pub struct ChangeItem {
    pub change_type: ChangeType,
    pub path: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub property_changes: Vec<PropertyChange>,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChangeSummary {
    pub total: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub risk_level: RiskLevel,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChangeSet {
    pub model: Vec<ChangeItem>,
    pub views: Vec<ChangeItem>,
    pub summary: ChangeSummary,
}

pub struct ChangeDetector;

impl ChangeDetector {
    pub fn detect_changes(original: &ConfigSnapshot, current: &ConfigSnapshot) -> ChangeSet {
        let mut model_items = Vec::new();
        diff_model(&original.model, &current.model, &mut model_items);

        let mut view_items = Vec::new();
        diff_views(&original.views, &current.views, &mut view_items);

        let all = model_items.iter().chain(view_items.iter());
        let creates = all.clone().filter(|i| i.change_type == ChangeType::Create).count();
        let updates = all.clone().filter(|i| i.change_type == ChangeType::Update).count();
        let deletes = all.clone().filter(|i| i.change_type == ChangeType::Delete).count();
        let risk_level = all
            .clone()
            .map(|i| i.risk_level)
            .max()
            .unwrap_or(RiskLevel::Low);

        ChangeSet {
            summary: ChangeSummary {
                total: model_items.len() + view_items.len(),
                creates,
                updates,
                deletes,
                risk_level,
            },
            model: model_items,
            views: view_items,
        }
    }
}

fn as_object(v: &Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap_or_default()
}

fn diff_model(original: &Option<Value>, current: &Option<Value>, out: &mut Vec<ChangeItem>) {
    let orig = original.as_ref().map(as_object).unwrap_or_default();
    let curr = current.as_ref().map(as_object).unwrap_or_default();

    for (key, changed, old, new) in property_diffs(&orig, &curr) {
        if key == "fields" {
            continue;
        }
        let risk = if key == "name" && changed == ChangeType::Update {
            RiskLevel::High
        } else {
            risk_for_property(changed)
        };
        let impact = (risk == RiskLevel::High)
            .then(|| "renaming a model breaks existing references to it".to_string());
        out.push(ChangeItem {
            change_type: changed,
            path: format!("model.{}", key),
            description: describe(changed, "model property", &key),
            old_value: old,
            new_value: new,
            property_changes: Vec::new(),
            risk_level: risk,
            impact,
        });
    }

    let orig_fields = named_entries(orig.get("fields"));
    let curr_fields = named_entries(curr.get("fields"));
    diff_named_collection(&orig_fields, &curr_fields, "model.fields", "field", out);
}

fn diff_views(original: &[Value], current: &[Value], out: &mut Vec<ChangeItem>) {
    let orig: Vec<(String, Value)> = original
        .iter()
        .filter_map(|v| v.get("name").and_then(Value::as_str).map(|n| (n.to_string(), v.clone())))
        .collect();
    let curr: Vec<(String, Value)> = current
        .iter()
        .filter_map(|v| v.get("name").and_then(Value::as_str).map(|n| (n.to_string(), v.clone())))
        .collect();
    diff_named_collection(&orig, &curr, "views", "view", out);
}

/// Diff two name-keyed collections: whole-entry deletions are high risk,
/// additions low, modifications carry per-property detail.
fn diff_named_collection(
    original: &[(String, Value)],
    current: &[(String, Value)],
    path_prefix: &str,
    kind: &str,
    out: &mut Vec<ChangeItem>,
) {
    for (name, old) in original {
        if !current.iter().any(|(n, _)| n == name) {
            out.push(ChangeItem {
                change_type: ChangeType::Delete,
                path: format!("{}.{}", path_prefix, name),
                description: format!("{} '{}' deleted", kind, name),
                old_value: Some(old.clone()),
                new_value: None,
                property_changes: Vec::new(),
                risk_level: RiskLevel::High,
                impact: Some(format!("existing data for this {} becomes unreachable", kind)),
            });
        }
    }
    for (name, new) in current {
        let Some((_, old)) = original.iter().find(|(n, _)| n == name) else {
            out.push(ChangeItem {
                change_type: ChangeType::Create,
                path: format!("{}.{}", path_prefix, name),
                description: format!("{} '{}' added", kind, name),
                old_value: None,
                new_value: Some(new.clone()),
                property_changes: Vec::new(),
                risk_level: RiskLevel::Low,
                impact: None,
            });
            continue;
        };
        if deep_eq(old, new) {
            continue;
        }
        let old_obj = as_object(old);
        let new_obj = as_object(new);
        let mut property_changes = Vec::new();
        let mut risk = RiskLevel::Low;
        for (key, changed, old_v, new_v) in property_diffs(&old_obj, &new_obj) {
            risk = risk.max(risk_for_property(changed));
            property_changes.push(PropertyChange {
                property: key,
                old_value: old_v.unwrap_or(Value::Null),
                new_value: new_v.unwrap_or(Value::Null),
            });
        }
        out.push(ChangeItem {
            change_type: ChangeType::Update,
            path: format!("{}.{}", path_prefix, name),
            description: format!("{} '{}' modified", kind, name),
            old_value: Some(old.clone()),
            new_value: Some(new.clone()),
            property_changes,
            risk_level: risk,
            impact: None,
        });
    }
}

fn risk_for_property(change_type: ChangeType) -> RiskLevel {
    match change_type {
        ChangeType::Create => RiskLevel::Low,
        ChangeType::Update => RiskLevel::Low,
        ChangeType::Delete => RiskLevel::Medium,
    }
}

type PropertyDiff = (String, ChangeType, Option<Value>, Option<Value>);

/// Per-key classification: absent-before/present-after is CREATE, both
/// present and different is UPDATE, present-before/absent-after is DELETE.
fn property_diffs(old: &Map<String, Value>, new: &Map<String, Value>) -> Vec<PropertyDiff> {
    let mut out = Vec::new();
    for (key, old_v) in old {
        match new.get(key) {
            None => out.push((key.clone(), ChangeType::Delete, Some(old_v.clone()), None)),
            Some(new_v) if !deep_eq(old_v, new_v) => out.push((
                key.clone(),
                ChangeType::Update,
                Some(old_v.clone()),
                Some(new_v.clone()),
            )),
            Some(_) => {}
        }
    }
    for (key, new_v) in new {
        if !old.contains_key(key) {
            out.push((key.clone(), ChangeType::Create, None, Some(new_v.clone())));
        }
    }
    out
}

fn describe(change_type: ChangeType, kind: &str, name: &str) -> String {
    match change_type {
        ChangeType::Create => format!("{} '{}' added", kind, name),
        ChangeType::Update => format!("{} '{}' changed", kind, name),
        ChangeType::Delete => format!("{} '{}' removed", kind, name),
    }
}

fn named_entries(fields: Option<&Value>) -> Vec<(String, Value)> {
    fields
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|f| {
                    f.get("name")
                        .and_then(Value::as_str)
                        .map(|n| (n.to_string(), f.clone()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Save-flow consistency check. Never blocks; the confirmation dialog renders
/// it and the human decides whether to proceed.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DataIntegrityReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub statistics: Map<String, Value>,
}

pub fn check_integrity(
    original_model: Option<&Value>,
    current_model: Option<&Value>,
    views: &[Value],
    changes: &IncrementalChanges,
) -> DataIntegrityReport {
    let mut report = DataIntegrityReport::default();

    let count_fields = |m: Option<&Value>| {
        m.and_then(|v| v.get("fields"))
            .and_then(Value::as_array)
            .map(|a| a.len())
            .unwrap_or(0)
    };
    let original_count = count_fields(original_model);
    let current_count = count_fields(current_model);
    let expected = original_count + changes.added_fields.len();
    let expected = expected.saturating_sub(changes.deleted_field_names.len());
    if current_count != expected {
        let msg = format!(
            "field count mismatch: original {} + {} added - {} deleted = {}, but current model has {}",
            original_count,
            changes.added_fields.len(),
            changes.deleted_field_names.len(),
            expected,
            current_count
        );
        tracing::warn!("{}", msg);
        report.warnings.push(msg);
    }

    if let Some(fields) = current_model
        .and_then(|m| m.get("fields"))
        .and_then(Value::as_array)
    {
        let mut seen = std::collections::HashSet::new();
        for f in fields {
            if let Some(name) = f.get("name").and_then(Value::as_str) {
                if !seen.insert(name.to_string()) {
                    report.errors.push(format!("duplicate field name: {}", name));
                }
            } else {
                report.errors.push("field without a name".to_string());
            }
        }
    }

    let model_name = current_model.and_then(|m| m.get("name")).and_then(Value::as_str);
    for view in views {
        let view_name = view.get("name").and_then(Value::as_str).unwrap_or("<unnamed>");
        let target = view.get("model_name").and_then(Value::as_str);
        if target.is_none() || (model_name.is_some() && target != model_name) {
            report.errors.push(format!(
                "view '{}' references model '{}' which is not part of this session",
                view_name,
                target.unwrap_or("<none>")
            ));
        }
    }

    report.statistics.insert("original_field_count".into(), original_count.into());
    report.statistics.insert("current_field_count".into(), current_count.into());
    report.statistics.insert("view_count".into(), views.len().into());
    report.statistics.insert("change_count".into(), changes.change_count.into());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(model: Value, views: Vec<Value>) -> ConfigSnapshot {
        ConfigSnapshot::new(Some(model), views)
    }

    #[test]
    fn deleting_a_field_is_high_risk() {
        let original = snapshot(
            json!({"name": "person", "fields": [{"name": "age", "type": "number"}]}),
            vec![],
        );
        let current = snapshot(json!({"name": "person", "fields": []}), vec![]);
        let set = ChangeDetector::detect_changes(&original, &current);
        let item = set
            .model
            .iter()
            .find(|i| i.path == "model.fields.age")
            .expect("delete item");
        assert_eq!(item.change_type, ChangeType::Delete);
        assert_eq!(item.risk_level, RiskLevel::High);
        assert_eq!(set.summary.risk_level, RiskLevel::High);
    }

    #[test]
    fn model_rename_dominates_summary_risk() {
        let original = snapshot(
            json!({"name": "person", "title": "Person", "fields": []}),
            vec![],
        );
        let current = snapshot(
            json!({"name": "human", "title": "Human", "fields": []}),
            vec![],
        );
        let set = ChangeDetector::detect_changes(&original, &current);
        let rename = set
            .model
            .iter()
            .find(|i| i.path == "model.name")
            .expect("rename item");
        assert_eq!(rename.risk_level, RiskLevel::High);
        // Max-risk aggregation: the low-risk title change does not dilute it.
        assert_eq!(set.summary.risk_level, RiskLevel::High);
    }

    #[test]
    fn additions_are_low_risk() {
        let original = snapshot(json!({"name": "person", "fields": []}), vec![]);
        let current = snapshot(
            json!({"name": "person", "fields": [{"name": "age", "type": "number"}]}),
            vec![],
        );
        let set = ChangeDetector::detect_changes(&original, &current);
        assert_eq!(set.model[0].change_type, ChangeType::Create);
        assert_eq!(set.summary.risk_level, RiskLevel::Low);
    }

    #[test]
    fn view_deletion_detected() {
        let original = ConfigSnapshot::new(
            Some(json!({"name": "person", "fields": []})),
            vec![json!({"name": "person_grid", "model_name": "person"})],
        );
        let current = ConfigSnapshot::new(Some(json!({"name": "person", "fields": []})), vec![]);
        let set = ChangeDetector::detect_changes(&original, &current);
        assert_eq!(set.views.len(), 1);
        assert_eq!(set.views[0].change_type, ChangeType::Delete);
        assert_eq!(set.views[0].risk_level, RiskLevel::High);
    }

    #[test]
    fn property_deletion_is_medium_risk() {
        let original = snapshot(
            json!({"name": "person", "fields": [{"name": "age", "type": "number", "validation": {"min": 0}}]}),
            vec![],
        );
        let current = snapshot(
            json!({"name": "person", "fields": [{"name": "age", "type": "number"}]}),
            vec![],
        );
        let set = ChangeDetector::detect_changes(&original, &current);
        let item = &set.model[0];
        assert_eq!(item.change_type, ChangeType::Update);
        assert_eq!(item.risk_level, RiskLevel::Medium);
        assert_eq!(item.property_changes.len(), 1);
        assert_eq!(item.property_changes[0].property, "validation");
    }

    #[test]
    fn integrity_flags_field_count_mismatch() {
        let original = json!({"name": "person", "fields": [{"name": "a"}, {"name": "b"}]});
        let current = json!({"name": "person", "fields": [{"name": "a"}]});
        let report =
            check_integrity(Some(&original), Some(&current), &[], &IncrementalChanges::default());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("field count mismatch"));
    }

    #[test]
    fn integrity_flags_duplicate_names() {
        let current = json!({"name": "person", "fields": [{"name": "a"}, {"name": "a"}]});
        let report =
            check_integrity(Some(&current), Some(&current), &[], &IncrementalChanges::default());
        assert_eq!(report.errors, vec!["duplicate field name: a".to_string()]);
    }

    #[test]
    fn integrity_flags_views_outside_the_session() {
        let model = json!({"name": "person", "fields": []});
        let views = vec![
            json!({"name": "person_grid", "model_name": "person"}),
            json!({"name": "stray", "model_name": "order"}),
        ];
        let report =
            check_integrity(Some(&model), Some(&model), &views, &IncrementalChanges::default());
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("stray"));
    }
}
