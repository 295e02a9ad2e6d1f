//! Aggregator plugin interface.
//!
//! An aggregator names itself, describes a parameter form for clients, and
//! turns parameters plus an [`AggregationContext`] into an
//! [`AggregationResult`]. Everything runs through the [`EventBackend`]
//! seam, so aggregators never see the wire.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use traceline_core::{
    EventBackend, FieldMappings, SearchRequest, TracelineError, TracelineResult,
};

/// Everything an aggregator needs to run against one sketch.
pub struct AggregationContext<'a> {
    /// Backend to execute against.
    pub backend: &'a dyn EventBackend,
    /// Sketch scoping label filters and result ownership.
    pub sketch_id: i64,
    /// Indices to aggregate over.
    pub indices: Vec<String>,
    /// Restrict to specific timelines; `None` means all in the indices.
    pub timeline_ids: Option<Vec<i64>>,
    /// Field mappings for the indices, used for keyword formatting.
    pub mappings: FieldMappings,
}

impl<'a> AggregationContext<'a> {
    /// Context over the given indices with empty mappings.
    #[must_use]
    pub fn new(backend: &'a dyn EventBackend, sketch_id: i64, indices: Vec<String>) -> Self {
        Self {
            backend,
            sketch_id,
            indices,
            timeline_ids: None,
            mappings: FieldMappings::default(),
        }
    }

    /// Format a field name for exact-match aggregation, appending
    /// `.keyword` to analyzed text fields.
    #[must_use]
    pub fn format_field(&self, field: &str) -> String {
        self.mappings.format_field(field)
    }
}

/// Widget type for one form field, mirrored by clients rendering the
/// aggregator's parameter form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormFieldType {
    Text,
    Number,
    DatetimePicker,
    Select,
}

/// One parameter in an aggregator's form description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    /// Parameter name, as expected in the params map.
    pub name: String,
    /// Human-readable label.
    pub label: String,
    /// Widget type.
    #[serde(rename = "type")]
    pub field_type: FormFieldType,
    /// Default value, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Whether the parameter must be supplied.
    pub required: bool,
}

impl FormField {
    #[must_use]
    pub fn required(name: &str, label: &str, field_type: FormFieldType) -> Self {
        Self {
            name: name.to_owned(),
            label: label.to_owned(),
            field_type,
            default: None,
            required: true,
        }
    }

    #[must_use]
    pub fn optional(name: &str, label: &str, field_type: FormFieldType, default: Value) -> Self {
        Self {
            name: name.to_owned(),
            label: label.to_owned(),
            field_type,
            default: Some(default),
            required: false,
        }
    }
}

/// Result of one aggregation run.
///
/// When `encoding` is present, every row in `values` carries the keys it
/// references, so clients can bind chart channels without inspecting rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Bucket rows (or a single stats object), shaped per aggregator.
    pub values: Vec<Value>,
    /// Chart channel bindings: which row key feeds each axis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Value>,
    /// Suggested chart type, when the aggregator has an opinion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,
    /// Field the aggregation ran over, when there is a single one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Chart title.
    pub title: String,
}

/// Channel bindings for an x/y chart: the x axis reads `x_field` from each
/// row, the y axis reads the `count` column.
#[must_use]
pub fn xy_encoding(x_field: &str, x_type: &str) -> Value {
    json!({
        "x": {"field": x_field, "type": x_type},
        "y": {"field": "count", "type": "quantitative"},
    })
}

/// An aggregation plugin.
pub trait Aggregator: Send + Sync {
    /// Registry name, lower-case.
    fn name(&self) -> &'static str;

    /// Human-readable name.
    fn display_name(&self) -> &'static str;

    /// One-line description shown in plugin listings.
    fn description(&self) -> &'static str;

    /// Hide from plugin listings; used by aggregators that only run as
    /// part of a larger flow.
    fn exclude_from_list(&self) -> bool {
        false
    }

    /// Parameter form description.
    fn form_fields(&self) -> Vec<FormField> {
        Vec::new()
    }

    /// Title for charts produced from these parameters.
    fn chart_title(&self, params: &Map<String, Value>) -> String;

    /// Execute the aggregation.
    fn run(
        &self,
        ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult>;
}

impl std::fmt::Debug for dyn Aggregator + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Run an assembled aggregation document and return the `aggregations`
/// section of the response.
pub fn execute_spec(ctx: &AggregationContext<'_>, spec: Value) -> TracelineResult<Value> {
    let mut request = SearchRequest::new(ctx.sketch_id, ctx.indices.clone());
    request.query_dsl = Some(spec);
    let response = ctx.backend.search(&request)?;
    Ok(response.aggregations.unwrap_or(Value::Null))
}

// ─── Parameter helpers ──────────────────────────────────────────────────────

/// Fetch a required string parameter.
pub fn required_str<'p>(params: &'p Map<String, Value>, name: &str) -> TracelineResult<&'p str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            TracelineError::bad_query(format!("missing required aggregation parameter '{name}'"))
        })
}

/// Fetch an optional string parameter.
#[must_use]
pub fn optional_str<'p>(params: &'p Map<String, Value>, name: &str) -> Option<&'p str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Fetch an optional integer parameter, with a default.
#[must_use]
pub fn optional_u64(params: &Map<String, Value>, name: &str, default: u64) -> u64 {
    params.get(name).and_then(Value::as_u64).unwrap_or(default)
}

/// Quote a field query value unless it is the match-all star.
///
/// `user:"root"` needs quotes so reserved characters stay literal, but
/// `user:"*"` would match the literal star instead of everything.
#[must_use]
pub fn field_query_string(field: &str, value: &str) -> String {
    if value == "*" {
        format!("{field}:{value}")
    } else {
        format!("{field}:\"{value}\"")
    }
}
