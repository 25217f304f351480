//! The incremental-changes ledger: a sparse diff against the original snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// An open property patch. Keys are copied through without semantic
/// validation; the save endpoint validates server-side.
pub type Patch = Map<String, Value>;

/// Every entry records only properties that differ from the original snapshot
/// after normalization. Entries that become no-ops are deleted, never left
/// empty.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IncrementalChanges {
    #[serde(default)]
    pub model_changes: Patch,
    /// view name -> partial view patch
    #[serde(default)]
    pub view_changes: HashMap<String, Patch>,
    #[serde(default)]
    pub added_fields: Vec<Value>,
    #[serde(default)]
    pub deleted_field_names: Vec<String>,
    /// field name -> partial field patch (original fields only)
    #[serde(default)]
    pub field_changes: HashMap<String, Patch>,
    /// view name -> field name -> partial item patch
    #[serde(default)]
    pub view_field_changes: HashMap<String, HashMap<String, Patch>>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub change_count: u32,
}

impl IncrementalChanges {
    pub fn is_empty(&self) -> bool {
        self.model_changes.is_empty()
            && self.view_changes.is_empty()
            && self.added_fields.is_empty()
            && self.deleted_field_names.is_empty()
            && self.field_changes.is_empty()
            && self.view_field_changes.is_empty()
    }

    /// Total number of recorded entries across all collections.
    pub fn entry_count(&self) -> u32 {
        let view_props: usize = self.view_changes.values().map(Patch::len).sum();
        let field_props: usize = self.field_changes.values().map(Patch::len).sum();
        let item_props: usize = self
            .view_field_changes
            .values()
            .flat_map(|per_view| per_view.values())
            .map(Patch::len)
            .sum();
        (self.model_changes.len()
            + view_props
            + self.added_fields.len()
            + self.deleted_field_names.len()
            + field_props
            + item_props) as u32
    }

    /// Refresh the counter and modification timestamp after a mutation.
    pub(crate) fn touch(&mut self) {
        self.change_count = self.entry_count();
        self.last_modified = Some(Utc::now());
    }
}

/// Per-collection counts shown in the save prompt.
#[derive(Clone, Debug, Serialize)]
pub struct ChangesSummary {
    pub model_properties: usize,
    pub views_changed: usize,
    pub fields_added: usize,
    pub fields_deleted: usize,
    pub fields_changed: usize,
    pub view_fields_changed: usize,
    pub total: u32,
    pub description: String,
}

impl ChangesSummary {
    pub fn of(changes: &IncrementalChanges) -> Self {
        let view_fields_changed = changes
            .view_field_changes
            .values()
            .map(|per_view| per_view.len())
            .sum();
        let mut parts = Vec::new();
        if !changes.model_changes.is_empty() {
            parts.push(format!("{} model propert{}", changes.model_changes.len(),
                if changes.model_changes.len() == 1 { "y" } else { "ies" }));
        }
        if !changes.added_fields.is_empty() {
            parts.push(format!("{} field(s) added", changes.added_fields.len()));
        }
        if !changes.deleted_field_names.is_empty() {
            parts.push(format!("{} field(s) deleted", changes.deleted_field_names.len()));
        }
        if !changes.field_changes.is_empty() {
            parts.push(format!("{} field(s) changed", changes.field_changes.len()));
        }
        if !changes.view_changes.is_empty() {
            parts.push(format!("{} view(s) changed", changes.view_changes.len()));
        }
        if view_fields_changed > 0 {
            parts.push(format!("{} view field(s) changed", view_fields_changed));
        }
        let description = if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join(", ")
        };
        ChangesSummary {
            model_properties: changes.model_changes.len(),
            views_changed: changes.view_changes.len(),
            fields_added: changes.added_fields.len(),
            fields_deleted: changes.deleted_field_names.len(),
            fields_changed: changes.field_changes.len(),
            view_fields_changed,
            total: changes.change_count,
            description,
        }
    }
}
