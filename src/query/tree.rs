//! Hierarchy reconstruction: flat parent/child edge rows reassembled into
//! nested JSON. Two shapes are supported: an explicit `children` tree and a
//! values-embedded hierarchy where children land under their relation field.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// One row of a traversal result: an object plus how it was reached.
#[derive(Clone, Debug)]
pub struct EdgeRow {
    pub id: String,
    pub parent_id: Option<String>,
    pub field_name: Option<String>,
    pub object: Value,
    pub depth: i32,
}

/// Reassemble edge rows into a forest of `{..object, children: [...]}` nodes.
/// A row whose parent is absent from the set becomes a root, so isolated
/// objects and rooted subtrees coexist in one result.
pub fn build_full_tree(rows: &[EdgeRow]) -> Vec<Value> {
    let ids: HashSet<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    let mut children: HashMap<&str, Vec<&EdgeRow>> = HashMap::new();
    let mut roots: Vec<&EdgeRow> = Vec::new();
    for row in rows {
        match row.parent_id.as_deref() {
            Some(parent) if ids.contains(parent) => {
                children.entry(parent).or_default().push(row);
            }
            _ => roots.push(row),
        }
    }
    let mut visited = HashSet::new();
    roots
        .iter()
        .map(|r| assemble_node(r, &children, &mut visited))
        .collect()
}

fn assemble_node(
    row: &EdgeRow,
    children: &HashMap<&str, Vec<&EdgeRow>>,
    visited: &mut HashSet<String>,
) -> Value {
    let mut node = match &row.object {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("object".to_string(), other.clone());
            map
        }
    };
    visited.insert(row.id.clone());
    let mut kids = Vec::new();
    if let Some(rows) = children.get(row.id.as_str()) {
        for child in rows {
            if visited.contains(&child.id) {
                continue;
            }
            kids.push(assemble_node(child, children, visited));
        }
    }
    node.insert("children".to_string(), Value::Array(kids));
    Value::Object(node)
}

/// Reassemble edge rows into a single object whose descendants are embedded
/// inside `values` under the relation field that reached them. Expects one
/// root (null parent); extra roots are ignored with a warning, no root at all
/// yields None.
pub fn build_hierarchy_in_values(rows: &[EdgeRow]) -> Option<Value> {
    let root_id = {
        let mut roots = rows.iter().filter(|r| r.parent_id.is_none());
        let first = roots.next()?;
        if roots.next().is_some() {
            tracing::warn!(root = %first.id, "multiple hierarchy roots, keeping the first");
        }
        first.id.clone()
    };

    let by_id: HashMap<&str, &EdgeRow> = rows.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut children: HashMap<&str, Vec<&EdgeRow>> = HashMap::new();
    for row in rows {
        if let Some(parent) = row.parent_id.as_deref() {
            children.entry(parent).or_default().push(row);
        }
    }
    let root = by_id.get(root_id.as_str())?;
    let mut visited = HashSet::new();
    Some(embed_node(root, &children, &mut visited))
}

fn embed_node(
    row: &EdgeRow,
    children: &HashMap<&str, Vec<&EdgeRow>>,
    visited: &mut HashSet<String>,
) -> Value {
    visited.insert(row.id.clone());
    let mut node = match &row.object {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("object".to_string(), other.clone());
            map
        }
    };
    let mut values = match node.remove("values") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    if let Some(rows) = children.get(row.id.as_str()) {
        for child in rows {
            if visited.contains(&child.id) {
                continue;
            }
            let embedded = embed_node(child, children, visited);
            let field = child.field_name.clone().unwrap_or_else(|| "children".to_string());
            match values.remove(&field) {
                // Second child under the same field promotes to an array.
                Some(Value::Array(mut arr)) => {
                    arr.push(embedded);
                    values.insert(field, Value::Array(arr));
                }
                Some(existing) if existing.is_object() => {
                    values.insert(field, Value::Array(vec![existing, embedded]));
                }
                _ => {
                    values.insert(field, embedded);
                }
            }
        }
    }
    node.insert("values".to_string(), Value::Object(values));
    Value::Object(node)
}
