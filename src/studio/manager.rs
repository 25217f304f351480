//! Change-tracking store for one editing session.
//!
//! Owns the immutable original snapshot and the incremental-changes ledger,
//! and projects the merged runtime view on demand. Every diff is taken
//! against the original snapshot, never against the previous runtime state,
//! so the exported ledger is always the true total delta for the session.

use crate::data::{deep_eq, merge_objects, view_prop_eq};
use crate::studio::changes::{ChangesSummary, IncrementalChanges, Patch};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Where the original snapshot came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSource {
    /// Fetched from the save endpoint (an existing model).
    Api,
    /// A fresh, empty model being authored.
    New,
}

/// Immutable server-truth snapshot, captured once per session.
#[derive(Clone, Debug)]
pub struct OriginalData {
    pub model: Option<Value>,
    pub views: Vec<Value>,
    pub timestamp: DateTime<Utc>,
    pub source: DataSource,
}

/// Original snapshot deep-merged with the ledger. Treat as read-only.
#[derive(Clone, Debug)]
pub struct RuntimeData {
    pub model: Option<Value>,
    pub views: Vec<Value>,
    pub merged_at: DateTime<Utc>,
}

pub struct StudioDataManager {
    original: OriginalData,
    changes: IncrementalChanges,
    runtime_cache: Option<RuntimeData>,
}

impl StudioDataManager {
    pub fn new(model: Option<Value>, views: Vec<Value>, source: DataSource) -> Self {
        StudioDataManager {
            original: OriginalData {
                model,
                views,
                timestamp: Utc::now(),
                source,
            },
            changes: IncrementalChanges::default(),
            runtime_cache: None,
        }
    }

    pub fn original(&self) -> &OriginalData {
        &self.original
    }

    /// Record the keys of `patch` that differ from the original model;
    /// reverted keys drop their ledger entry.
    pub fn update_model(&mut self, patch: Patch) {
        let original = self.original.model.clone();
        for (key, new_value) in patch {
            let orig_value = original
                .as_ref()
                .and_then(|m| m.get(&key))
                .cloned()
                .unwrap_or(Value::Null);
            if deep_eq(&orig_value, &new_value) {
                self.changes.model_changes.remove(&key);
            } else {
                self.changes.model_changes.insert(key, new_value);
            }
        }
        self.after_mutation();
    }

    /// Per-key diff against the original view with the matching name. The
    /// `items` key is compared after default-stripping normalization, so
    /// cosmetic default injection and element order never count as changes.
    pub fn update_view(&mut self, view_name: &str, patch: Patch) {
        let original_view = self
            .original
            .views
            .iter()
            .find(|v| v.get("name").and_then(Value::as_str) == Some(view_name))
            .cloned();
        let entry = self
            .changes
            .view_changes
            .entry(view_name.to_string())
            .or_default();
        for (key, new_value) in patch {
            let orig_value = original_view
                .as_ref()
                .and_then(|v| v.get(&key))
                .cloned()
                .unwrap_or(Value::Null);
            if view_prop_eq(&key, &orig_value, &new_value) {
                entry.remove(&key);
            } else {
                entry.insert(key, new_value);
            }
        }
        if entry.is_empty() {
            self.changes.view_changes.remove(view_name);
        }
        self.after_mutation();
    }

    /// Add a field. A name already tombstoned is revived: the tombstone is
    /// cleared and differences from the original field become patches. A name
    /// present in the original is treated as a patch, not an addition.
    pub fn add_field(&mut self, field: Value) {
        let Some(name) = field.get("name").and_then(Value::as_str).map(String::from) else {
            tracing::warn!("add_field: field has no name, ignoring");
            return;
        };

        if let Some(pos) = self.changes.deleted_field_names.iter().position(|n| n == &name) {
            self.changes.deleted_field_names.remove(pos);
        }

        if self.original_field(&name).is_some() {
            if let Value::Object(patch) = field {
                self.record_field_patch(&name, patch);
            }
        } else if let Some(existing) = self.added_field_mut(&name) {
            *existing = field;
        } else {
            self.changes.added_fields.push(field);
        }
        self.after_mutation();
    }

    /// Patch a field. Provenance decides the target: added fields are patched
    /// in place, original fields go through `field_changes`, tombstoned
    /// fields are left alone.
    pub fn update_field(&mut self, field_name: &str, patch: Patch) {
        if self.changes.deleted_field_names.iter().any(|n| n == field_name) {
            tracing::warn!(field = field_name, "update_field on a deleted field, ignoring");
            return;
        }
        if self.original_field(field_name).is_some() {
            self.record_field_patch(field_name, patch);
        } else if let Some(added) = self.added_field_mut(field_name) {
            if let Value::Object(obj) = added {
                for (k, v) in patch {
                    obj.insert(k, v);
                }
            }
        } else {
            tracing::warn!(field = field_name, "update_field on an unknown field, ignoring");
            return;
        }
        self.after_mutation();
    }

    /// Delete a field. A pure addition is removed from `added_fields`
    /// outright; an original field gets a tombstone (and loses any pending
    /// patch). A field is never in both collections.
    pub fn delete_field(&mut self, field_name: &str) {
        if let Some(pos) = self
            .changes
            .added_fields
            .iter()
            .position(|f| f.get("name").and_then(Value::as_str) == Some(field_name))
        {
            self.changes.added_fields.remove(pos);
        } else if self.original_field(field_name).is_some() {
            self.changes.field_changes.remove(field_name);
            if !self.changes.deleted_field_names.iter().any(|n| n == field_name) {
                self.changes.deleted_field_names.push(field_name.to_string());
            }
        } else {
            tracing::warn!(field = field_name, "delete_field on an unknown field, ignoring");
            return;
        }
        self.after_mutation();
    }

    /// Per-key diff of one view item against the original item, scoped to the
    /// (view, field) pair. Emptied entries collapse upward.
    pub fn update_view_field(&mut self, view_name: &str, field_name: &str, patch: Patch) {
        let original_item = self
            .original
            .views
            .iter()
            .find(|v| v.get("name").and_then(Value::as_str) == Some(view_name))
            .and_then(|v| v.get("items"))
            .and_then(Value::as_array)
            .and_then(|items| {
                items
                    .iter()
                    .find(|i| i.get("name").and_then(Value::as_str) == Some(field_name))
            })
            .cloned();

        let per_view = self
            .changes
            .view_field_changes
            .entry(view_name.to_string())
            .or_default();
        let entry = per_view.entry(field_name.to_string()).or_default();
        for (key, new_value) in patch {
            let orig_value = original_item
                .as_ref()
                .and_then(|i| i.get(&key))
                .cloned()
                .unwrap_or(Value::Null);
            if deep_eq(&orig_value, &new_value) {
                entry.remove(&key);
            } else {
                entry.insert(key, new_value);
            }
        }
        if entry.is_empty() {
            per_view.remove(field_name);
        }
        if per_view.is_empty() {
            self.changes.view_field_changes.remove(view_name);
        }
        self.after_mutation();
    }

    /// Lazily computed and memoized merge of original + ledger. Invalidated
    /// on every mutation.
    pub fn runtime_data(&mut self) -> &RuntimeData {
        let cached = match self.runtime_cache.take() {
            Some(rt) => rt,
            None => RuntimeData {
                model: self.merge_model(),
                views: self.merge_views(),
                merged_at: Utc::now(),
            },
        };
        self.runtime_cache.insert(cached)
    }

    /// Counter check plus a defensive sweep of all collections, in case the
    /// counter ever goes stale.
    pub fn has_unsaved_changes(&self) -> bool {
        self.changes.change_count > 0 || !self.changes.is_empty()
    }

    pub fn changes_summary(&self) -> ChangesSummary {
        ChangesSummary::of(&self.changes)
    }

    /// Wipe the ledger; the original snapshot is untouched.
    pub fn reset_changes(&mut self) {
        self.changes = IncrementalChanges::default();
        self.runtime_cache = None;
    }

    /// Deep clone of the ledger for the save endpoint.
    pub fn export_changes(&self) -> IncrementalChanges {
        self.changes.clone()
    }

    fn after_mutation(&mut self) {
        self.changes.touch();
        self.runtime_cache = None;
    }

    fn original_field(&self, name: &str) -> Option<&Value> {
        self.original
            .model
            .as_ref()
            .and_then(|m| m.get("fields"))
            .and_then(Value::as_array)
            .and_then(|fields| {
                fields
                    .iter()
                    .find(|f| f.get("name").and_then(Value::as_str) == Some(name))
            })
    }

    fn added_field_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.changes
            .added_fields
            .iter_mut()
            .find(|f| f.get("name").and_then(Value::as_str) == Some(name))
    }

    fn record_field_patch(&mut self, field_name: &str, patch: Patch) {
        let original_field = self.original_field(field_name).cloned();
        let entry = self
            .changes
            .field_changes
            .entry(field_name.to_string())
            .or_default();
        for (key, new_value) in patch {
            let orig_value = original_field
                .as_ref()
                .and_then(|f| f.get(&key))
                .cloned()
                .unwrap_or(Value::Null);
            if deep_eq(&orig_value, &new_value) {
                entry.remove(&key);
            } else {
                entry.insert(key, new_value);
            }
        }
        if entry.is_empty() {
            self.changes.field_changes.remove(field_name);
        }
    }

    /// Merge order: original -> model patch -> field patches (original order
    /// preserved) -> appended added fields -> deleted names filtered out.
    fn merge_model(&self) -> Option<Value> {
        let base = match (&self.original.model, self.changes.model_changes.is_empty()) {
            (Some(m), _) => m.clone(),
            (None, false) => Value::Object(Map::new()),
            (None, true) if !self.changes.added_fields.is_empty() => Value::Object(Map::new()),
            (None, true) => return None,
        };
        let mut model = match base {
            Value::Object(m) => m,
            other => return Some(other),
        };
        for (k, v) in &self.changes.model_changes {
            model.insert(k.clone(), v.clone());
        }

        let mut fields: Vec<Value> = model
            .get("fields")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for field in fields.iter_mut() {
            let Some(name) = field.get("name").and_then(Value::as_str) else {
                continue;
            };
            if let Some(patch) = self.changes.field_changes.get(name) {
                if let Value::Object(obj) = field {
                    *obj = merge_objects(obj, patch);
                }
            }
        }
        fields.extend(self.changes.added_fields.iter().cloned());
        fields.retain(|f| {
            f.get("name")
                .and_then(Value::as_str)
                .map(|n| !self.changes.deleted_field_names.iter().any(|d| d == n))
                .unwrap_or(true)
        });
        model.insert("fields".to_string(), Value::Array(fields));

        Some(Value::Object(model))
    }

    /// Each original view spread with its patch, then per-item patches
    /// applied to matching `items` entries by name.
    fn merge_views(&self) -> Vec<Value> {
        self.original
            .views
            .iter()
            .map(|view| {
                let name = view.get("name").and_then(Value::as_str).unwrap_or("");
                let mut merged = match view {
                    Value::Object(obj) => obj.clone(),
                    other => return other.clone(),
                };
                if let Some(patch) = self.changes.view_changes.get(name) {
                    merged = merge_objects(&merged, patch);
                }
                if let Some(item_patches) = self.changes.view_field_changes.get(name) {
                    if let Some(Value::Array(items)) = merged.get_mut("items") {
                        for item in items.iter_mut() {
                            let Some(item_name) =
                                item.get("name").and_then(Value::as_str).map(String::from)
                            else {
                                continue;
                            };
                            if let Some(patch) = item_patches.get(&item_name) {
                                if let Value::Object(obj) = item {
                                    *obj = merge_objects(obj, patch);
                                }
                            }
                        }
                    }
                }
                Value::Object(merged)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(v: Value) -> Patch {
        match v {
            Value::Object(m) => m,
            _ => panic!("patch must be an object"),
        }
    }

    fn person_model() -> Value {
        json!({
            "name": "person",
            "title": "Person",
            "fields": [
                {"name": "name", "type": "string", "order": 0},
                {"name": "age", "type": "number", "order": 1}
            ]
        })
    }

    fn person_grid() -> Value {
        json!({
            "name": "person_grid",
            "title": "People",
            "model_name": "person",
            "view_type": "grid",
            "items": [
                {"name": "name", "span_cols": 6},
                {"name": "age"}
            ]
        })
    }

    fn manager() -> StudioDataManager {
        StudioDataManager::new(Some(person_model()), vec![person_grid()], DataSource::Api)
    }

    #[test]
    fn reverting_every_touched_property_leaves_no_changes() {
        let mut m = manager();
        m.update_model(patch(json!({"title": "Humans"})));
        m.update_view("person_grid", patch(json!({"title": "Everyone"})));
        m.update_field("age", patch(json!({"order": 5})));
        assert!(m.has_unsaved_changes());

        m.update_model(patch(json!({"title": "Person"})));
        m.update_view("person_grid", patch(json!({"title": "People"})));
        m.update_field("age", patch(json!({"order": 1})));

        assert!(!m.has_unsaved_changes());
        assert!(m.export_changes().is_empty());
    }

    #[test]
    fn ledger_is_minimal_after_revert() {
        let mut m = manager();
        m.update_view("person_grid", patch(json!({"title": "X"})));
        m.update_view("person_grid", patch(json!({"title": "People"})));
        assert!(m.export_changes().view_changes.get("person_grid").is_none());
    }

    #[test]
    fn items_normalization_suppresses_cosmetic_changes() {
        let mut m = manager();
        // Same items, reordered, with defaults injected.
        m.update_view(
            "person_grid",
            patch(json!({
                "items": [
                    {"name": "age", "span_cols": 12, "order": 0, "required": false,
                     "title": "age", "widget_options": {}},
                    {"name": "name", "span_cols": 6}
                ]
            })),
        );
        assert!(!m.has_unsaved_changes());
    }

    #[test]
    fn items_real_change_is_recorded() {
        let mut m = manager();
        m.update_view(
            "person_grid",
            patch(json!({"items": [{"name": "name", "span_cols": 4}, {"name": "age"}]})),
        );
        assert!(m.has_unsaved_changes());
    }

    #[test]
    fn add_then_delete_new_field_leaves_nothing() {
        let mut m = manager();
        m.add_field(json!({"name": "email", "type": "string"}));
        m.delete_field("email");
        let changes = m.export_changes();
        assert!(changes.added_fields.is_empty());
        assert!(changes.deleted_field_names.is_empty());
    }

    #[test]
    fn delete_original_field_is_a_tombstone() {
        let mut m = manager();
        m.update_field("age", patch(json!({"order": 9})));
        m.delete_field("age");
        let changes = m.export_changes();
        assert_eq!(changes.deleted_field_names, vec!["age".to_string()]);
        assert!(changes.added_fields.is_empty());
        // Tombstone replaces any pending patch; never both.
        assert!(changes.field_changes.get("age").is_none());
    }

    #[test]
    fn re_adding_deleted_field_clears_tombstone() {
        let mut m = manager();
        m.delete_field("age");
        m.add_field(json!({"name": "age", "type": "number", "order": 1}));
        let changes = m.export_changes();
        assert!(changes.deleted_field_names.is_empty());
        assert!(changes.added_fields.is_empty());
    }

    #[test]
    fn merge_applies_patches_adds_and_deletes() {
        let mut m = manager();
        m.update_field("name", patch(json!({"title": "Full name"})));
        m.add_field(json!({"name": "email", "type": "string"}));
        m.delete_field("age");
        m.update_model(patch(json!({"title": "Humans"})));

        let rt = m.runtime_data();
        let model = rt.model.as_ref().expect("model");
        assert_eq!(model.get("title"), Some(&json!("Humans")));
        let fields = model.get("fields").and_then(Value::as_array).expect("fields");
        let names: Vec<&str> = fields
            .iter()
            .filter_map(|f| f.get("name").and_then(Value::as_str))
            .collect();
        assert_eq!(names, vec!["name", "email"]);
        assert_eq!(fields[0].get("title"), Some(&json!("Full name")));
        assert_eq!(fields[0].get("type"), Some(&json!("string")));
    }

    #[test]
    fn merge_view_applies_item_patches_by_name() {
        let mut m = manager();
        m.update_view_field("person_grid", "age", patch(json!({"span_cols": 3})));
        let rt = m.runtime_data();
        let items = rt.views[0].get("items").and_then(Value::as_array).expect("items");
        let age = items
            .iter()
            .find(|i| i.get("name") == Some(&json!("age")))
            .expect("age item");
        assert_eq!(age.get("span_cols"), Some(&json!(3)));
    }

    #[test]
    fn view_field_revert_collapses_entries() {
        let mut m = manager();
        m.update_view_field("person_grid", "name", patch(json!({"span_cols": 4})));
        m.update_view_field("person_grid", "name", patch(json!({"span_cols": 6})));
        let changes = m.export_changes();
        assert!(changes.view_field_changes.is_empty());
    }

    #[test]
    fn runtime_cache_invalidated_on_mutation() {
        let mut m = manager();
        let before = m.runtime_data().model.clone();
        m.update_model(patch(json!({"title": "Changed"})));
        let after = m.runtime_data().model.clone();
        assert_ne!(before, after);
    }

    #[test]
    fn reset_keeps_original() {
        let mut m = manager();
        m.update_model(patch(json!({"title": "X"})));
        m.reset_changes();
        assert!(!m.has_unsaved_changes());
        assert_eq!(m.original().model, Some(person_model()));
    }

    #[test]
    fn unknown_patch_keys_pass_through() {
        let mut m = manager();
        m.update_model(patch(json!({"not_a_real_prop": 42})));
        let rt = m.runtime_data();
        assert_eq!(
            rt.model.as_ref().and_then(|v| v.get("not_a_real_prop")),
            Some(&json!(42))
        );
    }

    #[test]
    fn summary_counts_collections() {
        let mut m = manager();
        m.add_field(json!({"name": "email", "type": "string"}));
        m.update_view("person_grid", patch(json!({"title": "X"})));
        let summary = m.changes_summary();
        assert_eq!(summary.fields_added, 1);
        assert_eq!(summary.views_changed, 1);
        assert!(summary.description.contains("field(s) added"));
    }
}
