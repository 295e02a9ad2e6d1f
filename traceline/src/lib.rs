//! # traceline
//!
//! Collaborative forensic timeline analysis: search, aggregate, annotate,
//! and export millions of timestamped events stored in an
//! OpenSearch-compatible backend.
//!
//! Timelines live in backend indices; a **sketch** groups one or more
//! timelines into an investigation and scopes every label, star, and
//! comment to it. Analysts query sketches with query strings or raw query
//! DSL, run analyzer plugins that annotate events in bulk, summarize
//! fields with aggregator plugins, and stream full result sets out as CSV.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use traceline::prelude::*;
//! use traceline::{IndexStore, StoreConfig};
//!
//! let store = IndexStore::connect(StoreConfig::default())?;
//!
//! let request = SearchRequest::new(sketch_id, vec!["case-evtx".into()])
//!     .with_query_string("data_type:\"windows:evtx:record\"");
//! let response = store.search(&request)?;
//! println!("{} events", response.hits.total);
//!
//! let mut analyzers = AnalyzerRegistry::with_defaults();
//! let ctx = AnalyzerContext::new(&store, sketch_id, "case-evtx");
//! for (name, summary) in
//!     analyzers.run_pipeline(&["chain".to_owned()], &ctx)?
//! {
//!     println!("{name}: {summary}");
//! }
//! ```
//!
//! ## Crate Layout
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | [`traceline-core`](core) | Types, error taxonomy, query builder, backend trait |
//! | [`traceline-datastore`](datastore) | HTTP index adapter, bulk buffer, label scripts |
//! | [`traceline-aggregate`](aggregate) | Aggregator plugins and registry |
//! | [`traceline-analyze`](analyze) | Analyzer plugins, event handles, registry |
//! | [`traceline-export`](export) | Streaming CSV export |
//!
//! ## Key Types
//!
//! - [`IndexStore`] — HTTP adapter implementing [`EventBackend`]
//! - [`SearchRequest`] / [`QueryFilter`] — what to search and how to page it
//! - [`HitStream`] — scroll-backed iterator over raw hits
//! - [`AnalyzerRegistry`] / [`AggregatorRegistry`] — plugin registries
//! - [`Event`] — staged-mutation handle used by analyzers
//! - [`export_csv`] — stream a full result set to CSV

// ─── Sub-crate module aliases (advanced access) ─────────────────────────────

/// Core types, traits, and error definitions.
pub use traceline_core as core;
/// HTTP index adapter and bulk import machinery.
pub use traceline_datastore as datastore;
/// Aggregation plugins and registry.
pub use traceline_aggregate as aggregate;
/// Analyzer plugins, event handles, and registry.
pub use traceline_analyze as analyze;
/// Streaming CSV export.
pub use traceline_export as export;

// ─── Flat import surface ────────────────────────────────────────────────────

pub use traceline_core::{
    build_query, total_hits_from_value, CancelToken, Chip, ChipKind, ChipOperator, EventBackend,
    EventHit,
    EventRef, FieldMappings, FlushReport, HitStream, LabelOp, LabelUpdate, QueryFilter,
    SearchHits, SearchRequest, SearchResponse, SessionId, SortOrder, TracelineError,
    TracelineResult, LABEL_FIELD, TIMELINE_ID_FIELD,
};

pub use traceline_datastore::{
    HttpTransport, IndexStore, LabelCount, StoreConfig, Transport, TransportConfig,
};

pub use traceline_aggregate::{
    AggregationContext, AggregationResult, Aggregator, AggregatorInfo, AggregatorRegistry,
    FormField, FormFieldType,
};

pub use traceline_analyze::{
    Analyzer, AnalyzerContext, AnalyzerInfo, AnalyzerRegistry, ChainPlugin, Event, EventStream,
    EventStreamSpec,
};

pub use traceline_export::{export_csv, EXPORT_PAGE_SIZE};

/// Common imports for working with traceline.
pub mod prelude {
    pub use traceline_aggregate::{AggregationContext, Aggregator, AggregatorRegistry};
    pub use traceline_analyze::{Analyzer, AnalyzerContext, AnalyzerRegistry};
    pub use traceline_core::{
        EventBackend, QueryFilter, SearchRequest, SearchResponse, TracelineError,
        TracelineResult,
    };
    pub use traceline_export::export_csv;
}
