//! Declarative model and view types matching the studio JSON payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Json,
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl FieldType {
    pub fn is_relation(&self) -> bool {
        matches!(
            self,
            FieldType::OneToOne | FieldType::OneToMany | FieldType::ManyToOne | FieldType::ManyToMany
        )
    }

    /// Whether the relation holds many targets from this side.
    pub fn is_to_many(&self) -> bool {
        matches!(self, FieldType::OneToMany | FieldType::ManyToMany)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Target model name; required when `field_type` is relational.
    #[serde(default)]
    pub ref_model: Option<String>,
    #[serde(default)]
    pub validation: Option<Value>,
    /// Display rank.
    #[serde(default)]
    pub order: i32,
}

/// Logical-to-physical column mapping for an external table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub local: String,
    pub remote: String,
}

/// Connection details for a model backed by a third-party database table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExternalConfig {
    pub url: String,
    pub table_name: String,
    #[serde(default)]
    pub mappings: Vec<ColumnMapping>,
}

impl ExternalConfig {
    pub fn remote_column(&self, local: &str) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| m.local == local)
            .map(|m| m.remote.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Present when the model reads from an external table instead of the
    /// internal object store.
    #[serde(default)]
    pub external: Option<ExternalConfig>,
}

impl Model {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewType {
    Form,
    Grid,
    Kanban,
    Dashboard,
    Mastail,
}

fn default_span_cols() -> u32 {
    12
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewField {
    /// A field name on the view's model, or a synthetic `$$`-prefixed name.
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_span_cols")]
    pub span_cols: u32,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub widget: Option<String>,
    #[serde(default)]
    pub widget_options: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct View {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    pub model_name: String,
    pub view_type: ViewType,
    #[serde(default)]
    pub items: Vec<ViewField>,
    #[serde(default = "default_true")]
    pub can_edit: bool,
    #[serde(default = "default_true")]
    pub can_new: bool,
    #[serde(default = "default_true")]
    pub can_delete: bool,
    #[serde(default)]
    pub density: Option<String>,
}
