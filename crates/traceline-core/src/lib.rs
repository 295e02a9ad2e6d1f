//! # traceline-core
//!
//! Shared foundation for the traceline workspace: the error taxonomy, the
//! search data model, the query builder, the backend trait seam, and the
//! tracing conventions.
//!
//! Everything here is backend-agnostic. The HTTP adapter lives in
//! `traceline-datastore`; aggregators, analyzers, and the exporter build on
//! the [`EventBackend`] trait and the pure [`query`] builder, which keeps
//! all of their logic testable against in-memory fakes.

pub mod cancel;
pub mod error;
pub mod filter;
pub mod mapping;
pub mod query;
pub mod stream;
pub mod tracing_config;
pub mod traits;
pub mod types;

pub use cancel::CancelToken;
pub use error::{TracelineError, TracelineResult};
pub use filter::{Chip, ChipKind, ChipOperator, EventRef, QueryFilter};
pub use mapping::FieldMappings;
pub use query::{build_events_query, build_labels_query, build_query, LABEL_FIELD, TIMELINE_ID_FIELD};
pub use stream::{HitStream, DEFAULT_STREAM_LIMIT};
pub use traits::EventBackend;
pub use types::{
    total_hits_from_value, EventHit, FlushReport, LabelOp, LabelUpdate, SearchHits, SearchRequest,
    SearchResponse, SessionId, SortOrder,
};
