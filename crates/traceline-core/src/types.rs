//! Core data types shared across the traceline workspace.
//!
//! Everything here is plain serde data: search requests and responses,
//! event hits, label updates, and the session identifier sum type. Backend
//! responses arrive as JSON; the types in this module normalize the
//! cross-version quirks (total-hits shapes, missing `_type`) so downstream
//! code never has to.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{TracelineError, TracelineResult};
use crate::filter::QueryFilter;

// ─── Sort order ─────────────────────────────────────────────────────────────

/// Sort direction for the `datetime` field.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Oldest events first.
    #[default]
    Asc,
    /// Newest events first.
    Desc,
}

impl SortOrder {
    /// Wire representation (`"asc"` / `"desc"`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

impl std::fmt::Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Total hits normalization ───────────────────────────────────────────────

/// Extract a total-hits count from any of the shapes backends produce.
///
/// Older backends report a bare integer, newer ones report
/// `{"value": N, "relation": "eq"}`, and some serializations hand back the
/// number as a string. All normalize to a plain count; unparsable input
/// counts as zero.
#[must_use]
pub fn total_hits_from_value(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::Object(map) => map.get("value").map_or(0, total_hits_from_value),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn deserialize_total<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(total_hits_from_value(&value))
}

// ─── Search responses ───────────────────────────────────────────────────────

/// The `hits` envelope of a search response.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SearchHits {
    /// Normalized total-hit count (see [`total_hits_from_value`]).
    #[serde(default, deserialize_with = "deserialize_total")]
    pub total: u64,
    /// Raw hit documents, in result order.
    #[serde(default)]
    pub hits: Vec<Value>,
}

/// A search or scroll response, parsed leniently.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SearchResponse {
    /// Server-side time in milliseconds.
    #[serde(default)]
    pub took: u64,
    /// Scroll context id, present when scrolling was requested.
    #[serde(default, rename = "_scroll_id")]
    pub scroll_id: Option<String>,
    /// Hit envelope.
    #[serde(default)]
    pub hits: SearchHits,
    /// Aggregation results, when the request carried aggregations.
    #[serde(default)]
    pub aggregations: Option<Value>,
}

impl SearchResponse {
    /// The empty response returned without touching the backend
    /// (e.g. when the index list is empty).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a raw backend response body.
    pub fn from_value(value: Value) -> TracelineResult<Self> {
        serde_json::from_value(value).map_err(TracelineError::from)
    }
}

// ─── Event hits ─────────────────────────────────────────────────────────────

fn default_doc_type() -> String {
    "_doc".to_owned()
}

/// One event document as returned in a hit list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHit {
    /// Document id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Document type; newer backends omit it, defaulting to `_doc`.
    #[serde(rename = "_type", default = "default_doc_type")]
    pub doc_type: String,
    /// Index the document lives in.
    #[serde(rename = "_index")]
    pub index: String,
    /// Source fields. Partial when the search used `return_fields`.
    #[serde(rename = "_source", default)]
    pub source: Map<String, Value>,
}

impl EventHit {
    /// Parse a raw hit document. Missing `_id` or `_index` is an error;
    /// everything else is defaulted.
    pub fn from_value(value: Value) -> TracelineResult<Self> {
        serde_json::from_value(value).map_err(TracelineError::from)
    }

    /// Fetch a source field as a string slice.
    #[must_use]
    pub fn source_str(&self, field: &str) -> Option<&str> {
        self.source.get(field).and_then(Value::as_str)
    }

    /// Fetch a source field as an integer.
    #[must_use]
    pub fn source_i64(&self, field: &str) -> Option<i64> {
        self.source.get(field).and_then(Value::as_i64)
    }
}

// ─── Session identifiers ────────────────────────────────────────────────────

/// A session identifier produced by a sessionizer.
///
/// The `session_id` event attribute is a map from session type to one of
/// these: plain numbered sessions use `Num`, account-qualified sessions
/// (e.g. `"3 (Administrator)"`) use `Text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionId {
    /// Sequential session number, starting at 1.
    Num(u64),
    /// Free-form session label.
    Text(String),
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

// ─── Label updates ──────────────────────────────────────────────────────────

/// What a label update should do to the event's label list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOp {
    /// Append the label unless an identical entry exists.
    Add,
    /// Remove entries matching `(name, sketch_id)`.
    Remove,
    /// Remove by `(name, sketch_id)`; if nothing was removed, append.
    Toggle,
}

/// A scripted label update against one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelUpdate {
    /// Index holding the event.
    pub index: String,
    /// Event document id.
    pub event_id: String,
    /// Sketch the label belongs to.
    pub sketch_id: i64,
    /// User performing the update; provenance only, never matched on
    /// removal.
    pub user_id: i64,
    /// Label name (e.g. `__ts_star`).
    pub label: String,
    /// Update operation.
    pub op: LabelOp,
}

// ─── Bulk flush reporting ───────────────────────────────────────────────────

/// Outcome of a bulk buffer flush.
///
/// Item-level rejections never fail the batch: accepted actions stand,
/// rejected ones accumulate in `error_container` keyed by failure
/// signature, and the flush itself reports success.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Actions sent in this flush.
    pub sent: u64,
    /// Events imported over the lifetime of the store.
    pub total_imported: u64,
    /// Whether the backend rejected at least one action.
    pub errors_in_upload: bool,
    /// Rejected-action counts keyed by failure signature.
    pub error_container: std::collections::BTreeMap<String, u64>,
}

impl FlushReport {
    /// Actions the backend rejected in this flush.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.error_container.values().sum()
    }

    /// Collapse the accumulated rejections into one error, for callers
    /// that treat a partial upload as fatal.
    #[must_use]
    pub fn item_error(&self) -> Option<TracelineError> {
        if !self.errors_in_upload {
            return None;
        }
        let summary = self
            .error_container
            .iter()
            .map(|(signature, count)| format!("{signature}: {count}"))
            .collect::<Vec<_>>()
            .join(", ");
        Some(TracelineError::BackendItemError {
            summary,
            dropped: self.dropped() as usize,
        })
    }
}

// ─── Search requests ────────────────────────────────────────────────────────

/// A search request as consumed by the index adapter.
///
/// The query builder turns this into the final backend query document; see
/// [`crate::query::build_query`] for the decision order between `query_dsl`,
/// event-id filters, and `query_string` plus chips.
#[derive(Debug, Default, Clone)]
pub struct SearchRequest {
    /// Sketch the search runs within; scopes label filters.
    pub sketch_id: i64,
    /// Indices to query. An empty list short-circuits to an empty result.
    pub indices: Vec<String>,
    /// Query string (e.g. `hostname:evil.com`).
    pub query_string: Option<String>,
    /// Full query DSL document; overrides `query_string` and chips.
    pub query_dsl: Option<Value>,
    /// Pagination, chips, and event-id filters.
    pub filter: QueryFilter,
    /// Aggregations to attach to the query.
    pub aggregations: Option<Value>,
    /// Source fields to return; `None` returns everything.
    pub return_fields: Option<Vec<String>>,
    /// Request a scroll context for the result set.
    pub enable_scroll: bool,
    /// Timelines to scope the search to.
    pub timeline_ids: Option<Vec<i64>>,
}

impl SearchRequest {
    /// A request over the given sketch and indices with default filters.
    #[must_use]
    pub fn new(sketch_id: i64, indices: Vec<String>) -> Self {
        Self {
            sketch_id,
            indices,
            ..Self::default()
        }
    }

    /// Set the query string.
    #[must_use]
    pub fn with_query_string(mut self, query: impl Into<String>) -> Self {
        self.query_string = Some(query.into());
        self
    }

    /// Set the query filter.
    #[must_use]
    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Restrict returned source fields.
    #[must_use]
    pub fn with_return_fields(mut self, fields: Vec<String>) -> Self {
        self.return_fields = Some(fields);
        self
    }

    /// Enable scrolling for the result set.
    #[must_use]
    pub fn with_scroll(mut self) -> Self {
        self.enable_scroll = true;
        self
    }
}
