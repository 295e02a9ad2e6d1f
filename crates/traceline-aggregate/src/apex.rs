//! Apex-chart aggregators: terms, rare terms, date histograms, and single
//! metrics shaped for client-side chart rendering.
//!
//! These aggregators take a list of field descriptors instead of a single
//! field name. A descriptor carries the field's mapping type as reported
//! by the client, so `.keyword` suffixing happens without a mapping
//! lookup. They share [`ApexQuerySpec`], a clause-addressable variant of
//! the plain spec builder: every filter helper names the boolean clause it
//! lands in and rejects clause names outside the boolean grammar.

use serde_json::{json, Map, Value};
use tracing::debug;

use traceline_core::{TracelineError, TracelineResult, LABEL_FIELD, TIMELINE_ID_FIELD};

use crate::interface::{
    execute_spec, optional_str, optional_u64, xy_encoding, AggregationContext, AggregationResult,
    Aggregator, FormField, FormFieldType,
};

/// Boolean clauses a filter may land in.
const VALID_CLAUSES: &[&str] = &["must", "must_not", "should", "filter"];

const SUPPORTED_CHARTS: &[&str] = &["bar", "column", "line", "heatmap", "number", "table"];

fn check_clause(clause: &str) -> TracelineResult<()> {
    if VALID_CLAUSES.contains(&clause) {
        return Ok(());
    }
    Err(TracelineError::bad_query(format!(
        "unknown boolean clause '{clause}'"
    )))
}

// ─── Clause-addressable query spec ──────────────────────────────────────────

/// Aggregation query document with clause-addressable filter helpers.
#[derive(Debug, Default, Clone)]
pub struct ApexQuerySpec {
    clauses: Map<String, Value>,
    aggs: Map<String, Value>,
}

impl ApexQuerySpec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn clause_list(&mut self, clause: &str) -> &mut Vec<Value> {
        self.clauses
            .entry(clause.to_owned())
            .or_insert_with(|| json!([]))
            .as_array_mut()
            .expect("clause lists are arrays")
    }

    /// Add a `query_string` filter. Empty queries are ignored.
    pub fn add_query_string_filter(&mut self, query: &str, clause: &str) -> TracelineResult<()> {
        check_clause(clause)?;
        if query.is_empty() {
            return Ok(());
        }
        self.clause_list(clause).push(json!({
            "query_string": {"query": query, "default_operator": "AND"}
        }));
        Ok(())
    }

    /// Add a `match_phrase` filter on one field.
    pub fn add_match_phrase_filter(
        &mut self,
        field: &str,
        value: &Value,
        clause: &str,
    ) -> TracelineResult<()> {
        check_clause(clause)?;
        self.clause_list(clause)
            .push(json!({"match_phrase": {(field): value}}));
        Ok(())
    }

    /// Add an exact `term` filter on one field.
    pub fn add_term_filter(
        &mut self,
        field: &str,
        value: &Value,
        clause: &str,
    ) -> TracelineResult<()> {
        check_clause(clause)?;
        self.clause_list(clause)
            .push(json!({"term": {(field): value}}));
        Ok(())
    }

    /// Narrow to events from the given timelines. An empty list is ignored.
    pub fn add_timeline_filter(
        &mut self,
        timeline_ids: &[i64],
        clause: &str,
    ) -> TracelineResult<()> {
        check_clause(clause)?;
        if timeline_ids.is_empty() {
            return Ok(());
        }
        self.clause_list(clause)
            .push(json!({"terms": {(TIMELINE_ID_FIELD): timeline_ids}}));
        Ok(())
    }

    /// Narrow to events carrying a sketch-scoped label.
    pub fn add_label_filter(
        &mut self,
        label: &str,
        sketch_id: i64,
        clause: &str,
    ) -> TracelineResult<()> {
        check_clause(clause)?;
        self.clause_list(clause).push(json!({
            "nested": {
                "query": {
                    "bool": {
                        "must": [
                            {"term": {"timesketch_label.name.keyword": label}},
                            {"term": {"timesketch_label.sketch_id": sketch_id}},
                        ]
                    }
                },
                "path": LABEL_FIELD,
            }
        }));
        Ok(())
    }

    /// Add one bound of a datetime range. Bounds on the same clause merge
    /// into a single range filter; an empty value is ignored.
    fn add_datetime_bound(
        &mut self,
        value: &str,
        operator: &str,
        clause: &str,
    ) -> TracelineResult<()> {
        check_clause(clause)?;
        if value.is_empty() {
            return Ok(());
        }
        let list = self.clause_list(clause);
        for filter in list.iter_mut() {
            if let Some(range) = filter.pointer_mut("/range/datetime") {
                range[operator] = json!(value);
                return Ok(());
            }
        }
        list.push(json!({"range": {"datetime": {(operator): value}}}));
        Ok(())
    }

    /// Lower datetime bound, inclusive.
    pub fn add_start_datetime(&mut self, value: &str, clause: &str) -> TracelineResult<()> {
        self.add_datetime_bound(value, "gte", clause)
    }

    /// Upper datetime bound, inclusive.
    pub fn add_end_datetime(&mut self, value: &str, clause: &str) -> TracelineResult<()> {
        self.add_datetime_bound(value, "lte", clause)
    }

    /// Both bounds of a datetime range at once.
    pub fn add_datetime_range(
        &mut self,
        start: &str,
        end: &str,
        clause: &str,
    ) -> TracelineResult<()> {
        self.add_start_datetime(start, clause)?;
        self.add_end_datetime(end, clause)
    }

    /// Set one named aggregation. Reusing a name replaces the earlier DSL.
    pub fn add_aggregation(&mut self, name: &str, dsl: Value) {
        self.aggs.insert(name.to_owned(), dsl);
    }

    /// Assemble the final query document.
    #[must_use]
    pub fn build(self) -> Value {
        let mut spec = json!({"size": 0});
        if !self.clauses.is_empty() {
            spec["query"] = json!({"bool": self.clauses});
        }
        if !self.aggs.is_empty() {
            spec["aggs"] = Value::Object(self.aggs);
        }
        spec
    }
}

// ─── Field descriptors ──────────────────────────────────────────────────────

/// One field to aggregate, with its client-reported mapping type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Raw field name, used as the row key.
    pub name: String,
    /// Name to aggregate on; `.keyword` appended for text fields.
    pub formatted: String,
}

impl FieldDescriptor {
    fn new(name: &str, mapping_type: Option<&str>) -> Self {
        let formatted = if mapping_type == Some("text") {
            format!("{name}.keyword")
        } else {
            name.to_owned()
        };
        Self {
            name: name.to_owned(),
            formatted,
        }
    }
}

/// Parse the `fields` parameter: a list of `{field, type}` descriptors,
/// with bare strings accepted as untyped fields.
pub fn parse_field_descriptors(
    params: &Map<String, Value>,
) -> TracelineResult<Vec<FieldDescriptor>> {
    let fields = params
        .get("fields")
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
        .ok_or_else(|| {
            TracelineError::bad_query("missing required aggregation parameter 'fields'".to_owned())
        })?;

    fields
        .iter()
        .map(|entry| match entry {
            Value::String(name) => Ok(FieldDescriptor::new(name, None)),
            Value::Object(descriptor) => {
                let name = descriptor.get("field").and_then(Value::as_str).ok_or_else(|| {
                    TracelineError::bad_query("field descriptor without a 'field' name".to_owned())
                })?;
                let mapping_type = descriptor.get("type").and_then(Value::as_str);
                Ok(FieldDescriptor::new(name, mapping_type))
            }
            other => Err(TracelineError::bad_query(format!(
                "field descriptor is neither a name nor an object: {other}"
            ))),
        })
        .collect()
}

// ─── Shared plumbing ────────────────────────────────────────────────────────

/// Spec with the shared narrowing filters applied: time bounds, query
/// string, and timeline scope, all in the `filter` clause.
fn base_spec(
    ctx: &AggregationContext<'_>,
    params: &Map<String, Value>,
) -> TracelineResult<ApexQuerySpec> {
    let mut spec = ApexQuerySpec::new();
    if let Some(start) = optional_str(params, "start_time") {
        spec.add_start_datetime(start, "filter")?;
    }
    if let Some(end) = optional_str(params, "end_time") {
        spec.add_end_datetime(end, "filter")?;
    }
    if let Some(query) = optional_str(params, "query_string") {
        spec.add_query_string_filter(query, "filter")?;
    }
    if let Some(ids) = &ctx.timeline_ids {
        spec.add_timeline_filter(ids, "filter")?;
    }
    Ok(spec)
}

fn chart_type(params: &Map<String, Value>) -> TracelineResult<String> {
    let chart = optional_str(params, "chart_type").unwrap_or("table");
    if !SUPPORTED_CHARTS.contains(&chart) {
        return Err(TracelineError::bad_query(format!(
            "unsupported chart type '{chart}'"
        )));
    }
    Ok(chart.to_owned())
}

fn apex_form_fields() -> Vec<FormField> {
    vec![
        FormField::required("fields", "Field descriptors to aggregate on", FormFieldType::Text),
        FormField::optional(
            "query_string",
            "Query to narrow events",
            FormFieldType::Text,
            Value::Null,
        ),
        FormField::optional(
            "start_time",
            "Start of time window",
            FormFieldType::DatetimePicker,
            Value::Null,
        ),
        FormField::optional(
            "end_time",
            "End of time window",
            FormFieldType::DatetimePicker,
            Value::Null,
        ),
        FormField::optional("chart_type", "Chart type", FormFieldType::Select, json!("table")),
    ]
}

fn apex_title(display_name: &str, params: &Map<String, Value>) -> String {
    match parse_field_descriptors(params) {
        Ok(descriptors) => {
            let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
            format!("{display_name} for {}", names.join(" - "))
        }
        Err(_) => display_name.to_owned(),
    }
}

/// Turn one field's bucket list into `{field: key, count: doc_count}` rows.
/// Date buckets prefer `key_as_string` over the epoch key.
fn bucket_rows(aggregations: &Value, descriptor: &FieldDescriptor) -> Vec<Value> {
    aggregations
        .pointer(&format!("/{}/buckets", descriptor.name))
        .and_then(Value::as_array)
        .map(|buckets| {
            buckets
                .iter()
                .map(|bucket| {
                    let key = bucket
                        .get("key_as_string")
                        .or_else(|| bucket.get("key"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    json!({
                        (descriptor.name.as_str()): key,
                        "count": bucket.get("doc_count").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Run a per-field bucket aggregation and shape the response into rows.
fn run_bucket_family(
    name: &'static str,
    ctx: &AggregationContext<'_>,
    params: &Map<String, Value>,
    title: String,
    x_type: &str,
    field_dsl: impl Fn(&FieldDescriptor) -> Value,
) -> TracelineResult<AggregationResult> {
    let descriptors = parse_field_descriptors(params)?;
    let chart = chart_type(params)?;

    let mut spec = base_spec(ctx, params)?;
    for descriptor in &descriptors {
        spec.add_aggregation(&descriptor.name, field_dsl(descriptor));
    }
    let spec = spec.build();
    debug!(target: "traceline", aggregator = name, "running apex aggregation");
    let aggregations = execute_spec(ctx, spec)?;

    let mut values = Vec::new();
    for descriptor in &descriptors {
        values.extend(bucket_rows(&aggregations, descriptor));
    }

    Ok(AggregationResult {
        values,
        encoding: Some(xy_encoding(&descriptors[0].name, x_type)),
        chart_type: Some(chart),
        field: (descriptors.len() == 1).then(|| descriptors[0].name.clone()),
        title,
    })
}

// ─── Top terms ──────────────────────────────────────────────────────────────

const DEFAULT_TOP_TERMS_LIMIT: u64 = 10;

/// Most frequent values per field.
#[derive(Debug, Default)]
pub struct TopTermsAggregator;

impl Aggregator for TopTermsAggregator {
    fn name(&self) -> &'static str {
        "apex_top_terms"
    }

    fn display_name(&self) -> &'static str {
        "Top terms"
    }

    fn description(&self) -> &'static str {
        "Aggregate the most frequent values of the given fields"
    }

    fn form_fields(&self) -> Vec<FormField> {
        let mut fields = apex_form_fields();
        fields.push(FormField::optional(
            "limit",
            "Number of buckets",
            FormFieldType::Number,
            json!(DEFAULT_TOP_TERMS_LIMIT),
        ));
        fields
    }

    fn chart_title(&self, params: &Map<String, Value>) -> String {
        apex_title(self.display_name(), params)
    }

    fn run(
        &self,
        ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let limit = optional_u64(params, "limit", DEFAULT_TOP_TERMS_LIMIT);
        run_bucket_family(
            self.name(),
            ctx,
            params,
            self.chart_title(params),
            "nominal",
            |descriptor| {
                json!({"terms": {"field": descriptor.formatted, "size": limit}})
            },
        )
    }
}

// ─── Rare terms ─────────────────────────────────────────────────────────────

const DEFAULT_MAX_DOC_COUNT: u64 = 1;

/// Least frequent values per field.
#[derive(Debug, Default)]
pub struct RareTermsAggregator;

impl Aggregator for RareTermsAggregator {
    fn name(&self) -> &'static str {
        "apex_rare_terms"
    }

    fn display_name(&self) -> &'static str {
        "Rare terms"
    }

    fn description(&self) -> &'static str {
        "Aggregate the least frequent values of the given fields"
    }

    fn form_fields(&self) -> Vec<FormField> {
        let mut fields = apex_form_fields();
        fields.push(FormField::optional(
            "max_doc_count",
            "Highest count still considered rare",
            FormFieldType::Number,
            json!(DEFAULT_MAX_DOC_COUNT),
        ));
        fields
    }

    fn chart_title(&self, params: &Map<String, Value>) -> String {
        apex_title(self.display_name(), params)
    }

    fn run(
        &self,
        ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let max_doc_count = optional_u64(params, "max_doc_count", DEFAULT_MAX_DOC_COUNT);
        run_bucket_family(
            self.name(),
            ctx,
            params,
            self.chart_title(params),
            "nominal",
            |descriptor| {
                json!({"rare_terms": {
                    "field": descriptor.formatted,
                    "max_doc_count": max_doc_count,
                }})
            },
        )
    }
}

// ─── Date histograms ────────────────────────────────────────────────────────

const DEFAULT_AUTO_BUCKETS: u64 = 50;

/// Date histogram with backend-chosen bucket intervals.
#[derive(Debug, Default)]
pub struct AutoDateHistogramAggregator;

impl Aggregator for AutoDateHistogramAggregator {
    fn name(&self) -> &'static str {
        "apex_auto_date_histogram"
    }

    fn display_name(&self) -> &'static str {
        "Auto date histogram"
    }

    fn description(&self) -> &'static str {
        "Event counts over time, with the interval picked to fit a bucket budget"
    }

    fn form_fields(&self) -> Vec<FormField> {
        let mut fields = apex_form_fields();
        fields.push(FormField::optional(
            "buckets",
            "Target number of buckets",
            FormFieldType::Number,
            json!(DEFAULT_AUTO_BUCKETS),
        ));
        fields
    }

    fn chart_title(&self, params: &Map<String, Value>) -> String {
        apex_title(self.display_name(), params)
    }

    fn run(
        &self,
        ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let buckets = optional_u64(params, "buckets", DEFAULT_AUTO_BUCKETS);
        run_bucket_family(
            self.name(),
            ctx,
            params,
            self.chart_title(params),
            "temporal",
            |descriptor| {
                json!({"auto_date_histogram": {
                    "field": descriptor.formatted,
                    "buckets": buckets,
                }})
            },
        )
    }
}

/// Date histogram at a fixed calendar interval.
#[derive(Debug, Default)]
pub struct CalendarDateHistogramAggregator;

impl Aggregator for CalendarDateHistogramAggregator {
    fn name(&self) -> &'static str {
        "apex_calendar_date_histogram"
    }

    fn display_name(&self) -> &'static str {
        "Calendar date histogram"
    }

    fn description(&self) -> &'static str {
        "Event counts per calendar interval"
    }

    fn form_fields(&self) -> Vec<FormField> {
        let mut fields = apex_form_fields();
        fields.push(FormField::optional(
            "calendar_interval",
            "Calendar interval",
            FormFieldType::Select,
            json!("year"),
        ));
        fields
    }

    fn chart_title(&self, params: &Map<String, Value>) -> String {
        apex_title(self.display_name(), params)
    }

    fn run(
        &self,
        ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let interval = optional_str(params, "calendar_interval")
            .unwrap_or("year")
            .to_owned();
        run_bucket_family(
            self.name(),
            ctx,
            params,
            self.chart_title(params),
            "temporal",
            |descriptor| {
                json!({"date_histogram": {
                    "field": descriptor.formatted,
                    "calendar_interval": interval,
                }})
            },
        )
    }
}

// ─── Single metric ──────────────────────────────────────────────────────────

const SUPPORTED_METRICS: &[&str] = &["min", "max", "avg", "sum", "cardinality", "value_count"];

/// One metric value per field.
#[derive(Debug, Default)]
pub struct SingleMetricAggregator;

impl Aggregator for SingleMetricAggregator {
    fn name(&self) -> &'static str {
        "apex_single_metric"
    }

    fn display_name(&self) -> &'static str {
        "Single metric"
    }

    fn description(&self) -> &'static str {
        "Compute one metric over each of the given fields"
    }

    fn form_fields(&self) -> Vec<FormField> {
        let mut fields = apex_form_fields();
        fields.push(FormField::required(
            "metric",
            "Metric to compute",
            FormFieldType::Select,
        ));
        fields
    }

    fn chart_title(&self, params: &Map<String, Value>) -> String {
        apex_title(self.display_name(), params)
    }

    fn run(
        &self,
        ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let metric = optional_str(params, "metric").ok_or_else(|| {
            TracelineError::bad_query("missing required aggregation parameter 'metric'".to_owned())
        })?;
        if !SUPPORTED_METRICS.contains(&metric) {
            return Err(TracelineError::bad_query(format!(
                "unsupported metric '{metric}'"
            )));
        }

        let descriptors = parse_field_descriptors(params)?;
        let chart = chart_type(params)?;
        let mut spec = base_spec(ctx, params)?;
        for descriptor in &descriptors {
            spec.add_aggregation(
                &descriptor.name,
                json!({(metric): {"field": descriptor.formatted}}),
            );
        }
        let aggregations = execute_spec(ctx, spec.build())?;

        let values = descriptors
            .iter()
            .map(|descriptor| {
                let value = aggregations
                    .pointer(&format!("/{}/value", descriptor.name))
                    .cloned()
                    .unwrap_or(Value::Null);
                json!({(descriptor.name.as_str()): value, "metric": metric})
            })
            .collect();

        Ok(AggregationResult {
            values,
            encoding: None,
            chart_type: Some(chart),
            field: (descriptors.len() == 1).then(|| descriptors[0].name.clone()),
            title: self.chart_title(params),
        })
    }
}

// ─── Manual vega spec ───────────────────────────────────────────────────────

/// Pass-through aggregator for charts specified as a full vega document.
#[derive(Debug, Default)]
pub struct ManualVegaSpecAggregator;

impl Aggregator for ManualVegaSpecAggregator {
    fn name(&self) -> &'static str {
        "manual_vega"
    }

    fn display_name(&self) -> &'static str {
        "Manual vega spec"
    }

    fn description(&self) -> &'static str {
        "Chart a user-supplied vega specification without querying the backend"
    }

    fn exclude_from_list(&self) -> bool {
        true
    }

    fn form_fields(&self) -> Vec<FormField> {
        vec![
            FormField::required("data", "Vega specification", FormFieldType::Text),
            FormField::optional("title", "Chart title", FormFieldType::Text, Value::Null),
        ]
    }

    fn chart_title(&self, params: &Map<String, Value>) -> String {
        optional_str(params, "title")
            .unwrap_or("Results from a manual vega spec")
            .to_owned()
    }

    fn run(
        &self,
        _ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let spec = params.get("data").cloned().ok_or_else(|| {
            TracelineError::bad_query("missing required aggregation parameter 'data'".to_owned())
        })?;
        if !spec.is_object() {
            return Err(TracelineError::bad_query(
                "vega specification must be an object".to_owned(),
            ));
        }

        Ok(AggregationResult {
            values: vec![spec],
            encoding: None,
            chart_type: Some("manual_vega".to_owned()),
            field: None,
            title: self.chart_title(params),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::AggBackend;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    fn user_fields() -> Value {
        json!([{"field": "username", "type": "text"}])
    }

    // ── Query spec ──────────────────────────────────────────────────────────

    #[test]
    fn filters_land_in_their_clause() {
        let mut spec = ApexQuerySpec::new();
        spec.add_query_string_filter("user:root", "filter").unwrap();
        spec.add_term_filter("hostname", &json!("web1"), "must_not").unwrap();
        let spec = spec.build();
        assert_eq!(
            spec["query"]["bool"]["filter"][0]["query_string"]["query"],
            json!("user:root")
        );
        assert_eq!(
            spec["query"]["bool"]["must_not"][0]["term"]["hostname"],
            json!("web1")
        );
    }

    #[test]
    fn unknown_clause_is_rejected() {
        let mut spec = ApexQuerySpec::new();
        let err = spec
            .add_query_string_filter("user:root", "should_not")
            .unwrap_err();
        assert!(matches!(err, TracelineError::BadQuery { .. }));
        for clause in ["must", "must_not", "should", "filter"] {
            spec.add_term_filter("user", &json!("root"), clause)
                .expect("valid clause");
        }
    }

    #[test]
    fn datetime_bounds_merge_into_one_range() {
        let mut spec = ApexQuerySpec::new();
        spec.add_start_datetime("2024-01-01T00:00:00", "filter").unwrap();
        spec.add_end_datetime("2024-02-01T00:00:00", "filter").unwrap();
        let spec = spec.build();
        let filters = spec["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(
            filters[0]["range"]["datetime"],
            json!({"gte": "2024-01-01T00:00:00", "lte": "2024-02-01T00:00:00"})
        );
    }

    #[test]
    fn label_filter_is_a_nested_query() {
        let mut spec = ApexQuerySpec::new();
        spec.add_label_filter("__ts_star", 9, "filter").unwrap();
        let spec = spec.build();
        let nested = &spec["query"]["bool"]["filter"][0]["nested"];
        assert_eq!(nested["path"], json!("timesketch_label"));
        assert_eq!(
            nested["query"]["bool"]["must"][1],
            json!({"term": {"timesketch_label.sketch_id": 9}})
        );
    }

    #[test]
    fn empty_spec_is_size_zero_only() {
        assert_eq!(ApexQuerySpec::new().build(), json!({"size": 0}));
    }

    // ── Field descriptors ───────────────────────────────────────────────────

    #[test]
    fn text_descriptors_get_keyword_suffix() {
        let descriptors = parse_field_descriptors(&params(&[(
            "fields",
            json!([
                {"field": "username", "type": "text"},
                {"field": "port", "type": "long"},
                "hostname",
            ]),
        )]))
        .expect("parse");
        assert_eq!(descriptors[0].formatted, "username.keyword");
        assert_eq!(descriptors[1].formatted, "port");
        assert_eq!(descriptors[2].formatted, "hostname");
        assert_eq!(descriptors[0].name, "username");
    }

    #[test]
    fn missing_or_empty_fields_are_an_error() {
        assert!(parse_field_descriptors(&Map::new()).is_err());
        assert!(parse_field_descriptors(&params(&[("fields", json!([]))])).is_err());
        assert!(parse_field_descriptors(&params(&[("fields", json!([7]))])).is_err());
    }

    // ── Top and rare terms ──────────────────────────────────────────────────

    #[test]
    fn top_terms_aggregates_the_keyword_variant() {
        let backend = AggBackend::new(json!({"username": {"buckets": [
            {"key": "root", "doc_count": 40},
            {"key": "alice", "doc_count": 12},
        ]}}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let result = TopTermsAggregator
            .run(&ctx, &params(&[("fields", user_fields())]))
            .expect("run");

        let spec = backend.last_spec();
        assert_eq!(
            spec["aggs"]["username"]["terms"]["field"],
            json!("username.keyword")
        );
        assert_eq!(spec["aggs"]["username"]["terms"]["size"], json!(10));
        assert_eq!(
            result.values,
            vec![
                json!({"username": "root", "count": 40}),
                json!({"username": "alice", "count": 12}),
            ]
        );
        assert_eq!(result.title, "Top terms for username");
    }

    #[test]
    fn top_terms_narrows_with_the_shared_filters() {
        let backend = AggBackend::new(json!({"username": {"buckets": []}}));
        let mut ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        ctx.timeline_ids = Some(vec![7]);
        TopTermsAggregator
            .run(
                &ctx,
                &params(&[
                    ("fields", user_fields()),
                    ("query_string", json!("tag:login")),
                    ("start_time", json!("2024-01-01T00:00:00")),
                    ("end_time", json!("2024-02-01T00:00:00")),
                ]),
            )
            .expect("run");
        let filters = backend.last_spec()["query"]["bool"]["filter"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(filters.len(), 3, "range, query string, and timeline scope");
        assert!(filters.iter().any(|f| f["range"]["datetime"]["gte"].is_string()));
        assert!(filters
            .iter()
            .any(|f| f["query_string"]["query"] == json!("tag:login")));
        assert!(filters
            .iter()
            .any(|f| f["terms"]["__ts_timeline_id"] == json!([7])));
    }

    #[test]
    fn rare_terms_uses_max_doc_count() {
        let backend = AggBackend::new(json!({"username": {"buckets": [
            {"key": "mallory", "doc_count": 1},
        ]}}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let result = RareTermsAggregator
            .run(
                &ctx,
                &params(&[("fields", user_fields()), ("max_doc_count", json!(2))]),
            )
            .expect("run");
        let spec = backend.last_spec();
        assert_eq!(
            spec["aggs"]["username"]["rare_terms"]["max_doc_count"],
            json!(2)
        );
        assert_eq!(result.values, vec![json!({"username": "mallory", "count": 1})]);
    }

    // ── Date histograms ─────────────────────────────────────────────────────

    #[test]
    fn auto_date_histogram_prefers_key_as_string() {
        let backend = AggBackend::new(json!({"datetime": {"buckets": [
            {"key": 1704067200000i64, "key_as_string": "2024-01-01T00:00:00", "doc_count": 5},
        ]}}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let result = AutoDateHistogramAggregator
            .run(&ctx, &params(&[("fields", json!(["datetime"]))]))
            .expect("run");
        let spec = backend.last_spec();
        assert_eq!(
            spec["aggs"]["datetime"]["auto_date_histogram"]["buckets"],
            json!(50)
        );
        assert_eq!(
            result.values,
            vec![json!({"datetime": "2024-01-01T00:00:00", "count": 5})]
        );
        let encoding = result.encoding.expect("encoding");
        assert_eq!(encoding["x"]["type"], json!("temporal"));
    }

    #[test]
    fn calendar_histogram_takes_an_interval() {
        let backend = AggBackend::new(json!({"datetime": {"buckets": []}}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        CalendarDateHistogramAggregator
            .run(
                &ctx,
                &params(&[
                    ("fields", json!(["datetime"])),
                    ("calendar_interval", json!("month")),
                ]),
            )
            .expect("run");
        assert_eq!(
            backend.last_spec()["aggs"]["datetime"]["date_histogram"]["calendar_interval"],
            json!("month")
        );
    }

    // ── Single metric ───────────────────────────────────────────────────────

    #[test]
    fn single_metric_shapes_one_row_per_field() {
        let backend = AggBackend::new(json!({
            "port": {"value": 1024.0},
            "pid": {"value": 99.0},
        }));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let result = SingleMetricAggregator
            .run(
                &ctx,
                &params(&[
                    ("fields", json!(["port", "pid"])),
                    ("metric", json!("max")),
                ]),
            )
            .expect("run");
        assert_eq!(
            backend.last_spec()["aggs"]["port"]["max"]["field"],
            json!("port")
        );
        assert_eq!(
            result.values,
            vec![
                json!({"port": 1024.0, "metric": "max"}),
                json!({"pid": 99.0, "metric": "max"}),
            ]
        );
    }

    #[test]
    fn unsupported_metric_is_rejected() {
        let backend = AggBackend::new(json!({}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let err = SingleMetricAggregator
            .run(
                &ctx,
                &params(&[("fields", json!(["port"])), ("metric", json!("median"))]),
            )
            .unwrap_err();
        assert!(matches!(err, TracelineError::BadQuery { .. }));
    }

    // ── Chart validation ────────────────────────────────────────────────────

    #[test]
    fn unsupported_chart_type_is_rejected() {
        let backend = AggBackend::new(json!({"username": {"buckets": []}}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let err = TopTermsAggregator
            .run(
                &ctx,
                &params(&[("fields", user_fields()), ("chart_type", json!("sparkline"))]),
            )
            .unwrap_err();
        assert!(matches!(err, TracelineError::BadQuery { .. }));
    }

    // ── Manual vega spec ────────────────────────────────────────────────────

    #[test]
    fn vega_spec_passes_through_untouched() {
        let backend = AggBackend::new(json!({}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let vega = json!({"mark": "bar", "encoding": {"x": {"field": "user"}}});
        let result = ManualVegaSpecAggregator
            .run(
                &ctx,
                &params(&[("data", vega.clone()), ("title", json!("Custom chart"))]),
            )
            .expect("run");
        assert_eq!(result.values, vec![vega]);
        assert_eq!(result.title, "Custom chart");
        assert_eq!(result.chart_type.as_deref(), Some("manual_vega"));
        assert!(ManualVegaSpecAggregator.exclude_from_list());
    }

    #[test]
    fn vega_spec_requires_an_object() {
        let backend = AggBackend::new(json!({}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        assert!(ManualVegaSpecAggregator.run(&ctx, &Map::new()).is_err());
        assert!(ManualVegaSpecAggregator
            .run(&ctx, &params(&[("data", json!("not an object"))]))
            .is_err());
    }
}
