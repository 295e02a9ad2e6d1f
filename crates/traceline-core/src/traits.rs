//! The backend seam.
//!
//! [`EventBackend`] is the dyn-compatible trait every consumer of the event
//! store depends on: aggregators, analyzers, and the exporter all take
//! `&dyn EventBackend`, so tests drive them with an in-memory fake and the
//! production path plugs in the HTTP adapter.

use serde_json::{Map, Value};

use crate::error::TracelineResult;
use crate::mapping::FieldMappings;
use crate::types::{EventHit, FlushReport, LabelUpdate, SearchRequest, SearchResponse};

/// Operations the event store exposes to the rest of the system.
///
/// Implementations buffer `import_event` calls and flush them in bulk;
/// callers that need durability call [`flush_queued_events`] explicitly.
///
/// [`flush_queued_events`]: EventBackend::flush_queued_events
pub trait EventBackend: Send + Sync {
    /// Execute a search request. An empty index list yields an empty
    /// response without touching the backend.
    fn search(&self, request: &SearchRequest) -> TracelineResult<SearchResponse>;

    /// Continue a scroll with the given keep-alive (e.g. `"5m"`).
    fn scroll(&self, scroll_id: &str, keep_alive: &str) -> TracelineResult<SearchResponse>;

    /// Document count and store size in bytes across the given indices.
    fn count_events(&self, indices: &[String]) -> TracelineResult<(u64, u64)>;

    /// Fetch one event by id, excluding the label field from the source.
    fn get_event(&self, index: &str, event_id: &str) -> TracelineResult<EventHit>;

    /// Queue an event for bulk import or update. With an `event_id` the
    /// action is a partial update, otherwise a fresh index action. Returns
    /// the lifetime import count.
    fn import_event(
        &self,
        index: &str,
        event_id: Option<&str>,
        event: Map<String, Value>,
        timeline_id: Option<i64>,
    ) -> TracelineResult<u64>;

    /// Flush the bulk buffer. Per-item failures surface as
    /// [`crate::error::TracelineError::BackendItemError`] after the
    /// successful items have been applied.
    fn flush_queued_events(&self) -> TracelineResult<FlushReport>;

    /// Apply a scripted label update to one event.
    fn set_label(&self, update: &LabelUpdate) -> TracelineResult<()>;

    /// Queue a scripted label update into the bulk buffer instead of
    /// applying it immediately.
    fn queue_label_update(&self, update: &LabelUpdate) -> TracelineResult<()>;

    /// Flattened field mappings for the given indices.
    fn field_mappings(&self, indices: &[String]) -> TracelineResult<FieldMappings>;

    /// Make recent writes to an index searchable.
    fn refresh(&self, index: &str) -> TracelineResult<()>;

    /// Create an index with the default event mapping. Succeeds if the
    /// index already exists.
    fn create_index(&self, index: &str) -> TracelineResult<()>;

    /// Delete an index. Deleting a missing index is not an error.
    fn delete_index(&self, index: &str) -> TracelineResult<()>;
}
