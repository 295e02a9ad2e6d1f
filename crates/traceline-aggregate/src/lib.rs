//! # traceline-aggregate
//!
//! Aggregation framework: the [`Aggregator`] plugin trait, the
//! [`AggregatorRegistry`], the [`AggregationQuerySpec`] builder, and the
//! built-in aggregators (terms buckets, date histograms, the apex chart
//! family, field summaries, and the manual feeds).
//!
//! Aggregators run as zero-hit searches through the
//! [`traceline_core::EventBackend`] seam, so every plugin is testable
//! against an in-memory fake.

pub mod apex;
pub mod bucket;
pub mod date_histogram;
pub mod feed;
pub mod interface;
pub mod manager;
pub mod spec;
pub mod summary;

#[cfg(test)]
pub(crate) mod testutil;

pub use apex::{
    parse_field_descriptors, ApexQuerySpec, AutoDateHistogramAggregator,
    CalendarDateHistogramAggregator, FieldDescriptor, ManualVegaSpecAggregator,
    RareTermsAggregator, SingleMetricAggregator, TopTermsAggregator,
};
pub use bucket::{FieldBucketAggregator, QueryBucketAggregator};
pub use date_histogram::DateHistogramAggregator;
pub use feed::ManualFeedAggregator;
pub use interface::{
    execute_spec, field_query_string, xy_encoding, AggregationContext, AggregationResult,
    Aggregator, FormField, FormFieldType,
};
pub use manager::{AggregatorInfo, AggregatorRegistry};
pub use spec::AggregationQuerySpec;
pub use summary::{CalendarSlice, DateFieldSummaryAggregator, FieldSummaryAggregator};
