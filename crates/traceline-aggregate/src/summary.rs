//! Field-profile aggregators used by exploratory views.
//!
//! Both aggregators here are excluded from the plugin listing: clients run
//! them behind field-analysis panes rather than offering them as charts.

use serde_json::{json, Map, Value};

use traceline_core::{TracelineError, TracelineResult};

use crate::interface::{
    execute_spec, optional_str, required_str, xy_encoding, AggregationContext, AggregationResult,
    Aggregator, FormField, FormFieldType,
};
use crate::spec::AggregationQuerySpec;

const PERCENTILE_STEPS: &[f64] = &[1.0, 5.0, 25.0, 50.0, 75.0, 95.0, 99.0];
const TOP_TERMS: u64 = 10;

fn is_numeric_type(field_type: Option<&str>) -> bool {
    matches!(
        field_type,
        Some("long" | "integer" | "short" | "byte" | "double" | "float" | "half_float" | "date")
    )
}

// ─── Field summary ──────────────────────────────────────────────────────────

/// Profile of one field: coverage, cardinality, and either top terms or
/// numeric distribution depending on the mapping type.
#[derive(Debug, Default)]
pub struct FieldSummaryAggregator;

impl Aggregator for FieldSummaryAggregator {
    fn name(&self) -> &'static str {
        "field_summary"
    }

    fn display_name(&self) -> &'static str {
        "Field summary"
    }

    fn description(&self) -> &'static str {
        "Summarize the distribution of one attribute"
    }

    fn exclude_from_list(&self) -> bool {
        true
    }

    fn form_fields(&self) -> Vec<FormField> {
        vec![
            FormField::required("field", "Field to summarize", FormFieldType::Text),
            FormField::optional(
                "query_string",
                "Query to narrow events",
                FormFieldType::Text,
                Value::Null,
            ),
        ]
    }

    fn chart_title(&self, params: &Map<String, Value>) -> String {
        match optional_str(params, "field") {
            Some(field) => format!("Summary for \"{field}\""),
            None => "Field summary".to_owned(),
        }
    }

    fn run(
        &self,
        ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let field = required_str(params, "field")?;
        let formatted = ctx.format_field(field);
        let numeric = is_numeric_type(ctx.mappings.field_type(field));

        let mut aggs = json!({
            "count": {"value_count": {"field": formatted}},
            "cardinality": {"cardinality": {"field": formatted}},
        });
        if numeric {
            aggs["stats"] = json!({"stats": {"field": formatted}});
            aggs["percentiles"] = json!({
                "percentiles": {"field": formatted, "percents": PERCENTILE_STEPS}
            });
        } else {
            aggs["top_terms"] = json!({
                "terms": {"field": formatted, "size": TOP_TERMS}
            });
        }

        let mut spec = AggregationQuerySpec::new();
        if let Some(ids) = &ctx.timeline_ids {
            spec = spec.timelines(ids);
        }
        if let Some(query) = optional_str(params, "query_string") {
            spec = spec.query_string(query);
        }
        let aggregations = execute_spec(ctx, spec.aggregation(aggs).build())?;

        let mut summary = json!({
            "field": field,
            "count": aggregations.pointer("/count/value").cloned().unwrap_or(json!(0)),
            "cardinality": aggregations
                .pointer("/cardinality/value")
                .cloned()
                .unwrap_or(json!(0)),
        });
        if numeric {
            summary["stats"] = aggregations.pointer("/stats").cloned().unwrap_or(Value::Null);
            summary["percentiles"] = aggregations
                .pointer("/percentiles/values")
                .cloned()
                .unwrap_or(Value::Null);
        } else {
            summary["top_terms"] = aggregations
                .pointer("/top_terms/buckets")
                .cloned()
                .unwrap_or(json!([]));
        }

        Ok(AggregationResult {
            values: vec![summary],
            encoding: None,
            chart_type: None,
            field: Some(field.to_owned()),
            title: self.chart_title(params),
        })
    }
}

// ─── Date-field summary ─────────────────────────────────────────────────────

/// Calendar slice for the scripted datetime histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarSlice {
    Year,
    Month,
    WeekDay,
    Hour,
    WeekDayHour,
}

impl CalendarSlice {
    fn parse(value: &str) -> TracelineResult<Self> {
        match value {
            "year" => Ok(Self::Year),
            "month" => Ok(Self::Month),
            "weekday" => Ok(Self::WeekDay),
            "hour" => Ok(Self::Hour),
            "weekday_hour" => Ok(Self::WeekDayHour),
            other => Err(TracelineError::bad_query(format!(
                "unsupported calendar slice '{other}', \
                 expected year, month, weekday, hour, or weekday_hour"
            ))),
        }
    }

    /// Painless expression extracting the slice from the datetime field.
    fn script(self) -> &'static str {
        match self {
            Self::Year => "doc['datetime'].value.getYear()",
            Self::Month => "doc['datetime'].value.getMonthValue()",
            Self::WeekDay => "doc['datetime'].value.getDayOfWeekEnum().getValue()",
            Self::Hour => "doc['datetime'].value.getHour()",
            Self::WeekDayHour => {
                "(doc['datetime'].value.getDayOfWeekEnum().getValue() - 1) * 24 \
                 + doc['datetime'].value.getHour()"
            }
        }
    }

    /// Bucket bounds, so heatmaps render empty slots. Years are unbounded.
    fn bounds(self) -> Option<(i64, i64)> {
        match self {
            Self::Year => None,
            Self::Month => Some((1, 12)),
            Self::WeekDay => Some((1, 7)),
            Self::Hour => Some((0, 23)),
            Self::WeekDayHour => Some((0, 167)),
        }
    }
}

/// Event counts per calendar slice (month of year, weekday, hour of day),
/// computed with a scripted histogram so the slicing happens server-side.
#[derive(Debug, Default)]
pub struct DateFieldSummaryAggregator;

impl Aggregator for DateFieldSummaryAggregator {
    fn name(&self) -> &'static str {
        "datefield_summary"
    }

    fn display_name(&self) -> &'static str {
        "Datetime summary"
    }

    fn description(&self) -> &'static str {
        "Count events per calendar slice of the datetime field"
    }

    fn exclude_from_list(&self) -> bool {
        true
    }

    fn form_fields(&self) -> Vec<FormField> {
        vec![
            FormField::required("slice", "Calendar slice", FormFieldType::Select),
            FormField::optional(
                "query_string",
                "Query to narrow events",
                FormFieldType::Text,
                Value::Null,
            ),
        ]
    }

    fn chart_title(&self, params: &Map<String, Value>) -> String {
        match optional_str(params, "slice") {
            Some(slice) => format!("Events per {slice}"),
            None => "Events per calendar slice".to_owned(),
        }
    }

    fn run(
        &self,
        ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let slice = CalendarSlice::parse(required_str(params, "slice")?)?;

        let mut histogram = json!({
            "script": {"source": slice.script()},
            "interval": 1,
            "min_doc_count": 0,
        });
        if let Some((min, max)) = slice.bounds() {
            histogram["extended_bounds"] = json!({"min": min, "max": max});
        }

        let mut spec = AggregationQuerySpec::new();
        if let Some(ids) = &ctx.timeline_ids {
            spec = spec.timelines(ids);
        }
        if let Some(query) = optional_str(params, "query_string") {
            spec = spec.query_string(query);
        }
        let spec = spec
            .aggregation(json!({"aggregation": {"histogram": histogram}}))
            .build();

        let aggregations = execute_spec(ctx, spec)?;
        let values = aggregations
            .pointer("/aggregation/buckets")
            .and_then(Value::as_array)
            .map(|buckets| {
                buckets
                    .iter()
                    .map(|bucket| {
                        json!({
                            "slice": bucket.get("key").cloned().unwrap_or(Value::Null),
                            "count": bucket.get("doc_count").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(AggregationResult {
            values,
            encoding: Some(xy_encoding("slice", "ordinal")),
            chart_type: Some("heatmap".to_owned()),
            field: None,
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

    // ── Field summary ───────────────────────────────────────────────────────

    #[test]
    fn text_field_gets_top_terms() {
        let backend = AggBackend::new(json!({
            "count": {"value": 100},
            "cardinality": {"value": 4},
            "top_terms": {"buckets": [{"key": "root", "doc_count": 60}]},
        }));
        let mut ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        ctx.mappings.insert("username", "text");
        let result = FieldSummaryAggregator
            .run(&ctx, &params(&[("field", json!("username"))]))
            .expect("run");
        let summary = &result.values[0];
        assert_eq!(summary["count"], json!(100));
        assert_eq!(summary["cardinality"], json!(4));
        assert_eq!(summary["top_terms"][0]["key"], json!("root"));
        assert!(summary.get("percentiles").is_none());

        let spec = backend.last_spec();
        assert_eq!(
            spec["aggs"]["top_terms"]["terms"]["field"],
            json!("username.keyword")
        );
    }

    #[test]
    fn numeric_field_gets_stats_and_percentiles() {
        let backend = AggBackend::new(json!({
            "count": {"value": 10},
            "cardinality": {"value": 10},
            "stats": {"min": 1.0, "max": 99.0, "avg": 40.0, "sum": 400.0, "count": 10},
            "percentiles": {"values": {"50.0": 38.0}},
        }));
        let mut ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        ctx.mappings.insert("port", "long");
        let result = FieldSummaryAggregator
            .run(&ctx, &params(&[("field", json!("port"))]))
            .expect("run");
        let summary = &result.values[0];
        assert_eq!(summary["stats"]["max"], json!(99.0));
        assert_eq!(summary["percentiles"]["50.0"], json!(38.0));
        assert!(summary.get("top_terms").is_none());
    }

    #[test]
    fn field_summary_is_hidden_from_listing() {
        assert!(FieldSummaryAggregator.exclude_from_list());
        assert!(DateFieldSummaryAggregator.exclude_from_list());
    }

    // ── Calendar slices ─────────────────────────────────────────────────────

    #[test]
    fn slice_scripts_and_bounds() {
        assert!(CalendarSlice::Year.bounds().is_none());
        assert_eq!(CalendarSlice::Month.bounds(), Some((1, 12)));
        assert_eq!(CalendarSlice::WeekDay.bounds(), Some((1, 7)));
        assert_eq!(CalendarSlice::Hour.bounds(), Some((0, 23)));
        assert_eq!(CalendarSlice::WeekDayHour.bounds(), Some((0, 167)));
        assert!(CalendarSlice::Hour.script().contains("getHour"));
    }

    #[test]
    fn unknown_slice_is_rejected() {
        assert!(CalendarSlice::parse("fortnight").is_err());
    }

    #[test]
    fn datefield_summary_builds_bounded_histogram() {
        let backend = AggBackend::new(json!({"aggregation": {"buckets": [
            {"key": 0, "doc_count": 3},
            {"key": 1, "doc_count": 0},
        ]}}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let result = DateFieldSummaryAggregator
            .run(&ctx, &params(&[("slice", json!("hour"))]))
            .expect("run");
        assert_eq!(result.values[0], json!({"slice": 0, "count": 3}));

        let spec = backend.last_spec();
        let histogram = &spec["aggs"]["aggregation"]["histogram"];
        assert_eq!(histogram["extended_bounds"], json!({"min": 0, "max": 23}));
        assert!(histogram["script"]["source"]
            .as_str()
            .unwrap()
            .contains("getHour"));
    }
}
