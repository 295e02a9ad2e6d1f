//! Event-frequency histogram over the `datetime` field.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde_json::{json, Map, Value};

use traceline_core::TracelineResult;

use crate::interface::{
    execute_spec, optional_str, xy_encoding, AggregationContext, AggregationResult, Aggregator,
    FormField, FormFieldType,
};
use crate::spec::AggregationQuerySpec;

const DEFAULT_INTERVAL: &str = "day";
const SUPPORTED_INTERVALS: &[&str] = &["year", "quarter", "month", "week", "day", "hour"];

const KEY_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.3fZ",
    "%Y-%m-%dT%H:%M:%S%.3f",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Decompose a bucket key into calendar parts so clients can facet rows by
/// hour of day or day of week without re-parsing timestamps.
fn date_parts(key: &str) -> Option<NaiveDateTime> {
    for format in KEY_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(key, format) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(key, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

fn histogram_row(bucket: &Value) -> Value {
    let key = bucket.get("key_as_string").and_then(Value::as_str);
    let mut row = json!({
        "datetime": key.map_or(Value::Null, |k| json!(k)),
        "count": bucket.get("doc_count").cloned().unwrap_or(Value::Null),
    });
    if let Some(parsed) = key.and_then(date_parts) {
        let object = row.as_object_mut().expect("row is an object");
        object.insert("year".to_owned(), json!(parsed.year()));
        object.insert("month".to_owned(), json!(parsed.month()));
        object.insert("day".to_owned(), json!(parsed.day()));
        object.insert("dow".to_owned(), json!(parsed.weekday().number_from_monday()));
        object.insert("hour".to_owned(), json!(parsed.hour()));
    }
    row
}

/// Event counts bucketed by calendar interval.
#[derive(Debug, Default)]
pub struct DateHistogramAggregator;

impl DateHistogramAggregator {
    fn interval<'p>(params: &'p Map<String, Value>) -> TracelineResult<&'p str> {
        let interval = optional_str(params, "interval").unwrap_or(DEFAULT_INTERVAL);
        if SUPPORTED_INTERVALS.contains(&interval) {
            Ok(interval)
        } else {
            Err(traceline_core::TracelineError::bad_query(format!(
                "unsupported calendar interval '{interval}', expected one of {}",
                SUPPORTED_INTERVALS.join(", ")
            )))
        }
    }
}

impl Aggregator for DateHistogramAggregator {
    fn name(&self) -> &'static str {
        "date_histogram"
    }

    fn display_name(&self) -> &'static str {
        "Date histogram"
    }

    fn description(&self) -> &'static str {
        "Count events per calendar interval"
    }

    fn form_fields(&self) -> Vec<FormField> {
        vec![
            FormField::optional(
                "query_string",
                "Query to narrow events",
                FormFieldType::Text,
                Value::Null,
            ),
            FormField::optional(
                "interval",
                "Calendar interval",
                FormFieldType::Select,
                json!(DEFAULT_INTERVAL),
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
        let interval = optional_str(params, "interval").unwrap_or(DEFAULT_INTERVAL);
        match optional_str(params, "query_string") {
            Some(query) => format!("Events per {interval} matching \"{query}\""),
            None => format!("Events per {interval}"),
        }
    }

    fn run(
        &self,
        ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let interval = Self::interval(params)?;

        let mut spec = AggregationQuerySpec::new();
        if let Some(ids) = &ctx.timeline_ids {
            spec = spec.timelines(ids);
        }
        if let Some(query) = optional_str(params, "query_string") {
            spec = spec.query_string(query);
        }
        if let (Some(start), Some(end)) = (
            optional_str(params, "start_time"),
            optional_str(params, "end_time"),
        ) {
            spec = spec.datetime_range(start, end);
        }
        let spec = spec
            .aggregation(json!({
                "aggregation": {
                    "date_histogram": {
                        "field": "datetime",
                        "calendar_interval": interval,
                        "min_doc_count": 0,
                    }
                }
            }))
            .build();

        let aggregations = execute_spec(ctx, spec)?;
        let values = aggregations
            .pointer("/aggregation/buckets")
            .and_then(Value::as_array)
            .map(|buckets| buckets.iter().map(histogram_row).collect())
            .unwrap_or_default();

        Ok(AggregationResult {
            values,
            encoding: Some(xy_encoding("datetime", "temporal")),
            chart_type: Some("linechart".to_owned()),
            field: Some("datetime".to_owned()),
            title: self.chart_title(params),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::AggBackend;

    fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn histogram_shapes_datetime_rows() {
        let backend = AggBackend::new(json!({"aggregation": {"buckets": [
            {"key_as_string": "2024-01-01T00:00:00", "key": 1_704_067_200_000_i64,
             "doc_count": 5},
            {"key_as_string": "2024-01-02T00:00:00", "key": 1_704_153_600_000_i64,
             "doc_count": 0},
        ]}}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let result = DateHistogramAggregator
            .run(&ctx, &Map::new())
            .expect("run");
        assert_eq!(
            result.values,
            vec![
                json!({
                    "datetime": "2024-01-01T00:00:00", "count": 5,
                    "year": 2024, "month": 1, "day": 1, "dow": 1, "hour": 0,
                }),
                json!({
                    "datetime": "2024-01-02T00:00:00", "count": 0,
                    "year": 2024, "month": 1, "day": 2, "dow": 2, "hour": 0,
                }),
            ]
        );
        assert_eq!(result.title, "Events per day");
        let encoding = result.encoding.expect("encoding");
        assert_eq!(encoding["x"]["field"], json!("datetime"));
        assert_eq!(encoding["x"]["type"], json!("temporal"));
    }

    #[test]
    fn unparsable_keys_keep_plain_rows() {
        let backend = AggBackend::new(json!({"aggregation": {"buckets": [
            {"key_as_string": "not-a-date", "key": 0, "doc_count": 3},
        ]}}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let result = DateHistogramAggregator
            .run(&ctx, &Map::new())
            .expect("run");
        assert_eq!(
            result.values,
            vec![json!({"datetime": "not-a-date", "count": 3})]
        );
    }

    #[test]
    fn date_only_keys_decompose_at_midnight() {
        let parsed = date_parts("2024-03-15").expect("parse");
        assert_eq!(parsed.hour(), 0);
        assert_eq!(parsed.weekday().number_from_monday(), 5);
    }

    #[test]
    fn interval_lands_in_spec() {
        let backend = AggBackend::new(json!({"aggregation": {"buckets": []}}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        DateHistogramAggregator
            .run(&ctx, &params(&[("interval", json!("hour"))]))
            .expect("run");
        let spec = backend.last_spec();
        assert_eq!(
            spec["aggs"]["aggregation"]["date_histogram"]["calendar_interval"],
            json!("hour")
        );
    }

    #[test]
    fn unknown_interval_is_rejected() {
        let backend = AggBackend::new(json!({}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        assert!(DateHistogramAggregator
            .run(&ctx, &params(&[("interval", json!("fortnight"))]))
            .is_err());
    }
}
