//! Manually fed aggregation: stores precomputed rows instead of querying.
//!
//! Analyzers that compute their own statistics save them through this
//! plugin so clients can chart them alongside backend-computed
//! aggregations.

use serde_json::{Map, Value};

use traceline_core::{TracelineError, TracelineResult};

use crate::interface::{
    optional_str, AggregationContext, AggregationResult, Aggregator, FormField, FormFieldType,
};

/// Pass-through aggregator for precomputed values.
#[derive(Debug, Default)]
pub struct ManualFeedAggregator;

impl Aggregator for ManualFeedAggregator {
    fn name(&self) -> &'static str {
        "manual_feed"
    }

    fn display_name(&self) -> &'static str {
        "Manually fed values"
    }

    fn description(&self) -> &'static str {
        "Chart precomputed values without querying the backend"
    }

    fn exclude_from_list(&self) -> bool {
        true
    }

    fn form_fields(&self) -> Vec<FormField> {
        vec![
            FormField::required("data", "Precomputed rows", FormFieldType::Text),
            FormField::optional(
                "title",
                "Chart title",
                FormFieldType::Text,
                Value::Null,
            ),
            FormField::optional(
                "chart_type",
                "Chart type",
                FormFieldType::Select,
                Value::Null,
            ),
            FormField::optional(
                "encoding",
                "Chart channel bindings",
                FormFieldType::Text,
                Value::Null,
            ),
        ]
    }

    fn chart_title(&self, params: &Map<String, Value>) -> String {
        optional_str(params, "title")
            .unwrap_or("Manually fed values")
            .to_owned()
    }

    fn run(
        &self,
        _ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let values = match params.get("data") {
            Some(Value::Array(rows)) => rows.clone(),
            Some(other) => vec![other.clone()],
            None => {
                return Err(TracelineError::bad_query(
                    "missing required aggregation parameter 'data'".to_owned(),
                ))
            }
        };

        Ok(AggregationResult {
            values,
            encoding: params.get("encoding").cloned().filter(Value::is_object),
            chart_type: optional_str(params, "chart_type").map(str::to_owned),
            field: None,
            title: self.chart_title(params),
        })
    }
}
