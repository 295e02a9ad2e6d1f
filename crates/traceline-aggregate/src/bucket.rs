//! Terms-bucket aggregators: top values of a field, optionally narrowed by
//! a query.

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use traceline_core::{TracelineError, TracelineResult};

use crate::interface::{
    execute_spec, field_query_string, optional_str, optional_u64, required_str, xy_encoding,
    AggregationContext, AggregationResult, Aggregator, FormField, FormFieldType,
};
use crate::spec::AggregationQuerySpec;

const DEFAULT_LIMIT: u64 = 10;

/// Turn a terms-bucket response into `{field: key, count: doc_count}` rows.
fn bucket_rows(aggregations: &Value, field: &str) -> Vec<Value> {
    aggregations
        .pointer("/aggregation/buckets")
        .and_then(Value::as_array)
        .map(|buckets| {
            buckets
                .iter()
                .map(|bucket| {
                    json!({
                        (field): bucket.get("key").cloned().unwrap_or(Value::Null),
                        "count": bucket.get("doc_count").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn terms_aggs(field: &str, limit: u64) -> Value {
    json!({
        "aggregation": {
            "terms": {
                "field": field,
                "size": limit,
                "order": {"_count": "desc"},
            }
        }
    })
}

fn common_spec(
    ctx: &AggregationContext<'_>,
    params: &Map<String, Value>,
) -> AggregationQuerySpec {
    let mut spec = AggregationQuerySpec::new();
    if let Some(ids) = &ctx.timeline_ids {
        spec = spec.timelines(ids);
    }
    if let (Some(start), Some(end)) = (
        optional_str(params, "start_time"),
        optional_str(params, "end_time"),
    ) {
        spec = spec.datetime_range(start, end);
    }
    spec
}

// ─── Field bucket ───────────────────────────────────────────────────────────

/// Top values of one field across all events.
#[derive(Debug, Default)]
pub struct FieldBucketAggregator;

impl Aggregator for FieldBucketAggregator {
    fn name(&self) -> &'static str {
        "field_bucket"
    }

    fn display_name(&self) -> &'static str {
        "Terms bucket"
    }

    fn description(&self) -> &'static str {
        "Aggregate the top values of an attribute"
    }

    fn form_fields(&self) -> Vec<FormField> {
        vec![
            FormField::required("field", "Field to aggregate on", FormFieldType::Text),
            FormField::optional(
                "limit",
                "Number of buckets",
                FormFieldType::Number,
                json!(DEFAULT_LIMIT),
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
        ]
    }

    fn chart_title(&self, params: &Map<String, Value>) -> String {
        match optional_str(params, "field") {
            Some(field) => format!("Top results for \"{field}\""),
            None => "Top results".to_owned(),
        }
    }

    fn run(
        &self,
        ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let field = required_str(params, "field")?;
        let limit = optional_u64(params, "limit", DEFAULT_LIMIT);
        let formatted = ctx.format_field(field);

        let spec = common_spec(ctx, params)
            .aggregation(terms_aggs(&formatted, limit))
            .build();
        debug!(
            target: "traceline",
            aggregator = self.name(),
            field = %formatted,
            "running terms bucket"
        );
        let aggregations = execute_spec(ctx, spec)?;

        Ok(AggregationResult {
            values: bucket_rows(&aggregations, field),
            encoding: Some(xy_encoding(field, "nominal")),
            chart_type: Some("barchart".to_owned()),
            field: Some(field.to_owned()),
            title: self.chart_title(params),
        })
    }
}

// ─── Query bucket ───────────────────────────────────────────────────────────

/// Merge bucket rows whose key matches the pattern into one canonical row,
/// summing their counts. Rows that do not match pass through untouched.
fn collapse_rows(
    rows: Vec<Value>,
    field: &str,
    pattern: &str,
    canonical: &str,
) -> TracelineResult<Vec<Value>> {
    let regex = Regex::new(pattern).map_err(|e| {
        TracelineError::bad_query(format!("invalid collapse pattern {pattern:?}: {e}"))
    })?;

    let mut collapsed_count: u64 = 0;
    let mut kept: Vec<Value> = Vec::new();
    for row in rows {
        let matches = row
            .get(field)
            .and_then(Value::as_str)
            .is_some_and(|key| regex.is_match(key));
        if matches {
            collapsed_count += row.get("count").and_then(Value::as_u64).unwrap_or(0);
        } else {
            kept.push(row);
        }
    }
    if collapsed_count > 0 {
        kept.push(json!({(field): canonical, "count": collapsed_count}));
        kept.sort_by(|a, b| {
            let count = |row: &Value| row.get("count").and_then(Value::as_u64).unwrap_or(0);
            count(b).cmp(&count(a))
        });
    }
    Ok(kept)
}

/// Top values of one field among events matching a query.
#[derive(Debug, Default)]
pub struct QueryBucketAggregator;

impl Aggregator for QueryBucketAggregator {
    fn name(&self) -> &'static str {
        "query_bucket"
    }

    fn display_name(&self) -> &'static str {
        "Filtered terms bucket"
    }

    fn description(&self) -> &'static str {
        "Aggregate the top values of an attribute for events matching a query"
    }

    fn form_fields(&self) -> Vec<FormField> {
        let mut fields = vec![FormField::required(
            "query_string",
            "Query to narrow events",
            FormFieldType::Text,
        )];
        fields.extend(FieldBucketAggregator.form_fields());
        fields.push(FormField::optional(
            "collapse_pattern",
            "Regex merging matching bucket keys into one",
            FormFieldType::Text,
            Value::Null,
        ));
        fields.push(FormField::optional(
            "collapse_key",
            "Canonical key for collapsed buckets",
            FormFieldType::Text,
            Value::Null,
        ));
        fields.push(FormField::optional(
            "include_first_last",
            "Look up first and last event time per bucket",
            FormFieldType::Select,
            json!(false),
        ));
        fields
    }

    fn chart_title(&self, params: &Map<String, Value>) -> String {
        match (
            optional_str(params, "field"),
            optional_str(params, "query_string"),
        ) {
            (Some(field), Some(query)) => {
                format!("Top results for \"{field}\" matching \"{query}\"")
            }
            (Some(field), None) => format!("Top results for \"{field}\""),
            _ => "Top results".to_owned(),
        }
    }

    fn run(
        &self,
        ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let field = required_str(params, "field")?;
        let query = required_str(params, "query_string")?;
        let limit = optional_u64(params, "limit", DEFAULT_LIMIT);
        let formatted = ctx.format_field(field);

        let spec = common_spec(ctx, params)
            .query_string(query)
            .aggregation(terms_aggs(&formatted, limit))
            .build();
        let aggregations = execute_spec(ctx, spec)?;
        let mut rows = bucket_rows(&aggregations, field);

        if let Some(pattern) = optional_str(params, "collapse_pattern") {
            let canonical = optional_str(params, "collapse_key").unwrap_or(pattern);
            rows = collapse_rows(rows, field, pattern, canonical)?;
        }

        if params
            .get("include_first_last")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            annotate_first_last(ctx, params, query, field, &formatted, &mut rows)?;
        }

        Ok(AggregationResult {
            values: rows,
            encoding: Some(xy_encoding(field, "nominal")),
            chart_type: Some("barchart".to_owned()),
            field: Some(field.to_owned()),
            title: self.chart_title(params),
        })
    }
}

/// Attach `first`/`last` event times to each bucket row via one min/max
/// lookup per bucket.
fn annotate_first_last(
    ctx: &AggregationContext<'_>,
    params: &Map<String, Value>,
    query: &str,
    field: &str,
    formatted: &str,
    rows: &mut [Value],
) -> TracelineResult<()> {
    for row in rows.iter_mut() {
        let Some(key) = row.get(field).and_then(Value::as_str).map(str::to_owned) else {
            continue;
        };
        let narrowed = format!("({query}) AND {}", field_query_string(formatted, &key));
        let spec = common_spec(ctx, params)
            .query_string(&narrowed)
            .aggregation(json!({
                "first": {"min": {"field": "datetime"}},
                "last": {"max": {"field": "datetime"}},
            }))
            .build();
        let aggregations = execute_spec(ctx, spec)?;
        if let Some(object) = row.as_object_mut() {
            for bound in ["first", "last"] {
                let value = aggregations
                    .pointer(&format!("/{bound}/value_as_string"))
                    .or_else(|| aggregations.pointer(&format!("/{bound}/value")))
                    .cloned()
                    .unwrap_or(Value::Null);
                object.insert(bound.to_owned(), value);
            }
        }
    }
    Ok(())
}

/// Build a query narrowing to one field value, as chained flows do when
/// pivoting from a bucket row back to the event list.
#[must_use]
pub fn bucket_pivot_query(field: &str, value: &str) -> String {
    field_query_string(field, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::AggBackend;
    use serde_json::json;

    fn canned_buckets() -> Value {
        json!({"aggregation": {"buckets": [
            {"key": "root", "doc_count": 40},
            {"key": "alice", "doc_count": 12},
        ]}})
    }

    fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    // ── Field bucket ────────────────────────────────────────────────────────

    #[test]
    fn field_bucket_shapes_rows() {
        let backend = AggBackend::new(canned_buckets());
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let result = FieldBucketAggregator
            .run(&ctx, &params(&[("field", json!("username"))]))
            .expect("run");
        assert_eq!(
            result.values,
            vec![
                json!({"username": "root", "count": 40}),
                json!({"username": "alice", "count": 12}),
            ]
        );
        assert_eq!(result.title, "Top results for \"username\"");
    }

    #[test]
    fn field_bucket_appends_keyword_for_text_fields() {
        let backend = AggBackend::new(canned_buckets());
        let mut ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        ctx.mappings.insert("username", "text");
        FieldBucketAggregator
            .run(&ctx, &params(&[("field", json!("username"))]))
            .expect("run");
        let spec = backend.last_spec();
        assert_eq!(
            spec["aggs"]["aggregation"]["terms"]["field"],
            json!("username.keyword")
        );
        assert_eq!(spec["aggs"]["aggregation"]["terms"]["size"], json!(10));
    }

    #[test]
    fn field_bucket_requires_field() {
        let backend = AggBackend::new(canned_buckets());
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        assert!(FieldBucketAggregator.run(&ctx, &Map::new()).is_err());
    }

    #[test]
    fn field_bucket_scopes_to_timelines() {
        let backend = AggBackend::new(canned_buckets());
        let mut ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        ctx.timeline_ids = Some(vec![7]);
        FieldBucketAggregator
            .run(&ctx, &params(&[("field", json!("username"))]))
            .expect("run");
        let spec = backend.last_spec();
        assert_eq!(
            spec["query"]["bool"]["must"][0]["terms"]["__ts_timeline_id"],
            json!([7])
        );
    }

    // ── Query bucket ────────────────────────────────────────────────────────

    #[test]
    fn query_bucket_narrows_with_query_string() {
        let backend = AggBackend::new(canned_buckets());
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let result = QueryBucketAggregator
            .run(
                &ctx,
                &params(&[
                    ("field", json!("username")),
                    ("query_string", json!("data_type:\"syslog:line\"")),
                ]),
            )
            .expect("run");
        let spec = backend.last_spec();
        assert_eq!(
            spec["query"]["bool"]["must"][0]["query_string"]["query"],
            json!("data_type:\"syslog:line\"")
        );
        assert!(result.title.contains("syslog:line"));
    }

    #[test]
    fn query_bucket_requires_query_string() {
        let backend = AggBackend::new(canned_buckets());
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        assert!(QueryBucketAggregator
            .run(&ctx, &params(&[("field", json!("username"))]))
            .is_err());
    }

    #[test]
    fn query_bucket_binds_chart_channels() {
        let backend = AggBackend::new(canned_buckets());
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let result = QueryBucketAggregator
            .run(
                &ctx,
                &params(&[("field", json!("user")), ("query_string", json!("*"))]),
            )
            .expect("run");
        let encoding = result.encoding.expect("encoding");
        assert_eq!(encoding["x"]["field"], json!("user"));
        assert_eq!(encoding["y"]["field"], json!("count"));
        assert_eq!(result.field.as_deref(), Some("user"));
    }

    #[test]
    fn query_bucket_collapses_matching_keys() {
        let backend = AggBackend::new(json!({"aggregation": {"buckets": [
            {"key": "chrome.exe", "doc_count": 30},
            {"key": "CHROME.EXE", "doc_count": 25},
            {"key": "svchost.exe", "doc_count": 40},
        ]}}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let result = QueryBucketAggregator
            .run(
                &ctx,
                &params(&[
                    ("field", json!("executable")),
                    ("query_string", json!("*")),
                    ("collapse_pattern", json!("(?i)^chrome\\.exe$")),
                    ("collapse_key", json!("chrome.exe")),
                ]),
            )
            .expect("run");
        assert_eq!(
            result.values,
            vec![
                json!({"executable": "chrome.exe", "count": 55}),
                json!({"executable": "svchost.exe", "count": 40}),
            ]
        );
    }

    #[test]
    fn query_bucket_rejects_invalid_collapse_pattern() {
        let backend = AggBackend::new(canned_buckets());
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let err = QueryBucketAggregator
            .run(
                &ctx,
                &params(&[
                    ("field", json!("username")),
                    ("query_string", json!("*")),
                    ("collapse_pattern", json!("(unclosed")),
                ]),
            )
            .unwrap_err();
        assert!(matches!(err, TracelineError::BadQuery { .. }));
    }

    #[test]
    fn query_bucket_looks_up_first_and_last_per_bucket() {
        let backend = AggBackend::new(json!({
            "aggregation": {"buckets": [{"key": "root", "doc_count": 40}]},
            "first": {"value": 1.0, "value_as_string": "2024-05-01T10:00:00"},
            "last": {"value": 2.0, "value_as_string": "2024-05-02T08:00:00"},
        }));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let result = QueryBucketAggregator
            .run(
                &ctx,
                &params(&[
                    ("field", json!("username")),
                    ("query_string", json!("tag:login")),
                    ("include_first_last", json!(true)),
                ]),
            )
            .expect("run");
        assert_eq!(result.values[0]["first"], json!("2024-05-01T10:00:00"));
        assert_eq!(result.values[0]["last"], json!("2024-05-02T08:00:00"));
        let spec = backend.last_spec();
        assert_eq!(
            spec["query"]["bool"]["must"][0]["query_string"]["query"],
            json!("(tag:login) AND username:\"root\"")
        );
        assert!(spec["aggs"]["first"]["min"].is_object());
    }

    // ── Pivot queries ───────────────────────────────────────────────────────

    #[test]
    fn pivot_query_quotes_values() {
        assert_eq!(bucket_pivot_query("username", "root"), "username:\"root\"");
        assert_eq!(bucket_pivot_query("username", "*"), "username:*");
    }
}
