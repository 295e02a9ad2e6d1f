//! Field mapping table for a set of indices.
//!
//! Aggregations on analyzed `text` fields must target the `.keyword`
//! sub-field; everything else aggregates on the field itself. The mapping
//! table answers that question from a flattened `field → type` view of the
//! backend's mapping response.

use std::collections::BTreeMap;

use serde_json::Value;

/// Flattened `field → type` mapping for one or more indices.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FieldMappings {
    types: BTreeMap<String, String>,
}

impl FieldMappings {
    /// Build from a raw `_mapping` response.
    ///
    /// The response nests `index → mappings → properties → field`; object
    /// fields nest further `properties`, flattened here into dotted paths.
    /// When two indices disagree on a field's type, the last one wins; the
    /// distinction only matters for `.keyword` suffixing, where disagreement
    /// is already a data problem.
    #[must_use]
    pub fn from_mapping_response(response: &Value) -> Self {
        let mut types = BTreeMap::new();
        if let Some(indices) = response.as_object() {
            for index_body in indices.values() {
                if let Some(properties) = index_body
                    .get("mappings")
                    .and_then(|m| m.get("properties"))
                    .and_then(Value::as_object)
                {
                    flatten_properties(properties, "", &mut types);
                }
            }
        }
        Self { types }
    }

    /// Mapping type of a field, when known.
    #[must_use]
    pub fn field_type(&self, field: &str) -> Option<&str> {
        self.types.get(field).map(String::as_str)
    }

    /// Format a field name for exact-value aggregation: analyzed `text`
    /// fields get the `.keyword` suffix, everything else is unchanged.
    #[must_use]
    pub fn format_field(&self, field: &str) -> String {
        if self.field_type(field) == Some("text") {
            format!("{field}.keyword")
        } else {
            field.to_owned()
        }
    }

    /// Number of known fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Insert a mapping entry directly. Mostly useful in tests.
    pub fn insert(&mut self, field: impl Into<String>, field_type: impl Into<String>) {
        self.types.insert(field.into(), field_type.into());
    }
}

fn flatten_properties(
    properties: &serde_json::Map<String, Value>,
    prefix: &str,
    out: &mut BTreeMap<String, String>,
) {
    for (name, body) in properties {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        if let Some(field_type) = body.get("type").and_then(Value::as_str) {
            out.insert(path.clone(), field_type.to_owned());
        }
        if let Some(nested) = body.get("properties").and_then(Value::as_object) {
            flatten_properties(nested, &path, out);
        }
    }
}
