//! Aggregator registry.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

use traceline_core::{TracelineError, TracelineResult};

use crate::apex::{
    AutoDateHistogramAggregator, CalendarDateHistogramAggregator, ManualVegaSpecAggregator,
    RareTermsAggregator, SingleMetricAggregator, TopTermsAggregator,
};
use crate::bucket::{FieldBucketAggregator, QueryBucketAggregator};
use crate::date_histogram::DateHistogramAggregator;
use crate::feed::ManualFeedAggregator;
use crate::interface::{AggregationContext, AggregationResult, Aggregator};
use crate::summary::{DateFieldSummaryAggregator, FieldSummaryAggregator};

/// One row of [`AggregatorRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
}

/// Registry of aggregation plugins, keyed by name.
#[derive(Default)]
pub struct AggregatorRegistry {
    plugins: BTreeMap<&'static str, Box<dyn Aggregator>>,
}

impl AggregatorRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in aggregator registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for plugin in [
            Box::new(FieldBucketAggregator) as Box<dyn Aggregator>,
            Box::new(QueryBucketAggregator),
            Box::new(DateHistogramAggregator),
            Box::new(TopTermsAggregator),
            Box::new(RareTermsAggregator),
            Box::new(AutoDateHistogramAggregator),
            Box::new(CalendarDateHistogramAggregator),
            Box::new(SingleMetricAggregator),
            Box::new(FieldSummaryAggregator),
            Box::new(DateFieldSummaryAggregator),
            Box::new(ManualFeedAggregator),
            Box::new(ManualVegaSpecAggregator),
        ] {
            // Built-in names are unique; a collision is a programming error
            // caught by the registration tests.
            let _ = registry.register(plugin);
        }
        registry
    }

    /// Register a plugin under its own name.
    pub fn register(&mut self, plugin: Box<dyn Aggregator>) -> TracelineResult<()> {
        let name = plugin.name();
        if self.plugins.contains_key(name) {
            return Err(TracelineError::DuplicateRegistration {
                kind: "aggregator",
                name: name.to_owned(),
            });
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Look up a plugin by name.
    pub fn get(&self, name: &str) -> TracelineResult<&dyn Aggregator> {
        self.plugins
            .get(name)
            .map(Box::as_ref)
            .ok_or_else(|| TracelineError::UnknownPlugin {
                kind: "aggregator",
                name: name.to_owned(),
            })
    }

    /// Listable plugins, sorted by name. Hidden plugins are skipped.
    #[must_use]
    pub fn list(&self) -> Vec<AggregatorInfo> {
        self.plugins
            .values()
            .filter(|plugin| !plugin.exclude_from_list())
            .map(|plugin| AggregatorInfo {
                name: plugin.name(),
                display_name: plugin.display_name(),
                description: plugin.description(),
            })
            .collect()
    }

    /// Run one plugin by name.
    pub fn run(
        &self,
        name: &str,
        ctx: &AggregationContext<'_>,
        params: &Map<String, Value>,
    ) -> TracelineResult<AggregationResult> {
        let plugin = self.get(name)?;
        debug!(
            target: "traceline",
            aggregator = name,
            sketch_id = ctx.sketch_id,
            "running aggregator"
        );
        plugin.run(ctx, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::AggBackend;
    use serde_json::json;

    // ── Registration ────────────────────────────────────────────────────────

    #[test]
    fn defaults_register_all_builtins() {
        let registry = AggregatorRegistry::with_defaults();
        for name in [
            "field_bucket",
            "query_bucket",
            "date_histogram",
            "apex_top_terms",
            "apex_rare_terms",
            "apex_auto_date_histogram",
            "apex_calendar_date_histogram",
            "apex_single_metric",
            "field_summary",
            "datefield_summary",
            "manual_feed",
            "manual_vega",
        ] {
            assert!(registry.get(name).is_ok(), "{name} must be registered");
        }
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut registry = AggregatorRegistry::new();
        registry
            .register(Box::new(FieldBucketAggregator))
            .expect("first registration");
        let err = registry
            .register(Box::new(FieldBucketAggregator))
            .unwrap_err();
        assert!(matches!(
            err,
            TracelineError::DuplicateRegistration {
                kind: "aggregator",
                ..
            }
        ));
    }

    #[test]
    fn unknown_plugin_is_an_error() {
        let registry = AggregatorRegistry::with_defaults();
        let err = registry.get("nonexistent").unwrap_err();
        assert!(matches!(
            err,
            TracelineError::UnknownPlugin {
                kind: "aggregator",
                ..
            }
        ));
    }

    // ── Listing ─────────────────────────────────────────────────────────────

    #[test]
    fn listing_hides_excluded_plugins_and_sorts() {
        let registry = AggregatorRegistry::with_defaults();
        let names: Vec<&str> = registry.list().iter().map(|info| info.name).collect();
        assert_eq!(
            names,
            vec![
                "apex_auto_date_histogram",
                "apex_calendar_date_histogram",
                "apex_rare_terms",
                "apex_single_metric",
                "apex_top_terms",
                "date_histogram",
                "field_bucket",
                "query_bucket",
            ]
        );
    }

    // ── Running ─────────────────────────────────────────────────────────────

    #[test]
    fn run_dispatches_by_name() {
        let backend = AggBackend::new(json!({"aggregation": {"buckets": []}}));
        let ctx = AggregationContext::new(&backend, 1, vec!["idx".to_owned()]);
        let registry = AggregatorRegistry::with_defaults();
        let mut params = Map::new();
        params.insert("field".to_owned(), json!("username"));
        let result = registry.run("field_bucket", &ctx, &params).expect("run");
        assert!(result.values.is_empty());
    }
}
