//! Builder for aggregation query documents.
//!
//! Aggregations run as zero-hit searches: the query part narrows the event
//! set, the `aggs` part does the counting. This builder assembles both,
//! merging multiple datetime ranges into a single should-group so ranges
//! widen the window instead of intersecting to nothing.

use serde_json::{json, Value};

use traceline_core::TIMELINE_ID_FIELD;

/// Aggregation query document under construction.
#[derive(Debug, Default, Clone)]
pub struct AggregationQuerySpec {
    clauses: Vec<Value>,
    ranges: Vec<(String, String)>,
    aggs: Option<Value>,
}

impl AggregationQuerySpec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Narrow to events matching a query string.
    #[must_use]
    pub fn query_string(mut self, query: &str) -> Self {
        self.clauses
            .push(json!({"query_string": {"query": query}}));
        self
    }

    /// Narrow to events from the given timelines.
    #[must_use]
    pub fn timelines(mut self, timeline_ids: &[i64]) -> Self {
        if !timeline_ids.is_empty() {
            self.clauses
                .push(json!({"terms": {(TIMELINE_ID_FIELD): timeline_ids}}));
        }
        self
    }

    /// Add a datetime window. Multiple windows are unioned.
    #[must_use]
    pub fn datetime_range(mut self, start: &str, end: &str) -> Self {
        self.ranges.push((start.to_owned(), end.to_owned()));
        self
    }

    /// Set the `aggs` section.
    #[must_use]
    pub fn aggregation(mut self, aggs: Value) -> Self {
        self.aggs = Some(aggs);
        self
    }

    /// Assemble the final query document.
    #[must_use]
    pub fn build(self) -> Value {
        let mut must = self.clauses;

        match self.ranges.len() {
            0 => {}
            1 => {
                let (start, end) = &self.ranges[0];
                must.push(json!({"range": {"datetime": {"gte": start, "lte": end}}}));
            }
            _ => {
                let should: Vec<Value> = self
                    .ranges
                    .iter()
                    .map(|(start, end)| {
                        json!({"range": {"datetime": {"gte": start, "lte": end}}})
                    })
                    .collect();
                must.push(json!({"bool": {"should": should, "minimum_should_match": 1}}));
            }
        }

        let mut spec = json!({"size": 0});
        if !must.is_empty() {
            spec["query"] = json!({"bool": {"must": must}});
        }
        if let Some(aggs) = self.aggs {
            spec["aggs"] = aggs;
        }
        spec
    }
}
