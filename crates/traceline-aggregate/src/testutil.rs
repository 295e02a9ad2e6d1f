//! Shared test fakes for the aggregators.

use std::sync::Mutex;

use serde_json::Value;

use traceline_core::{
    EventBackend, EventHit, FieldMappings, FlushReport, LabelUpdate, SearchRequest,
    SearchResponse, TracelineError, TracelineResult,
};

/// Backend fake that records the aggregation document and replays a canned
/// aggregations section.
pub(crate) struct AggBackend {
    aggregations: Value,
    requests: Mutex<Vec<SearchRequest>>,
}

impl AggBackend {
    pub(crate) fn new(aggregations: Value) -> Self {
        Self {
            aggregations,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn last_spec(&self) -> Value {
        self.requests
            .lock()
            .unwrap()
            .last()
            .and_then(|r| r.query_dsl.clone())
            .expect("a spec was sent")
    }
}

impl EventBackend for AggBackend {
    fn search(&self, request: &SearchRequest) -> TracelineResult<SearchResponse> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(SearchResponse {
            aggregations: Some(self.aggregations.clone()),
            ..SearchResponse::empty()
        })
    }

    fn scroll(&self, _: &str, _: &str) -> TracelineResult<SearchResponse> {
        unimplemented!("not used by aggregators")
    }

    fn count_events(&self, _: &[String]) -> TracelineResult<(u64, u64)> {
        Ok((0, 0))
    }

    fn get_event(&self, index: &str, event_id: &str) -> TracelineResult<EventHit> {
        Err(TracelineError::BackendNotFound {
            kind: "document",
            id: format!("{index}/{event_id}"),
        })
    }

    fn import_event(
        &self,
        _: &str,
        _: Option<&str>,
        _: serde_json::Map<String, Value>,
        _: Option<i64>,
    ) -> TracelineResult<u64> {
        Ok(0)
    }

    fn flush_queued_events(&self) -> TracelineResult<FlushReport> {
        Ok(FlushReport::default())
    }

    fn set_label(&self, _: &LabelUpdate) -> TracelineResult<()> {
        Ok(())
    }

    fn queue_label_update(&self, _: &LabelUpdate) -> TracelineResult<()> {
        Ok(())
    }

    fn field_mappings(&self, _: &[String]) -> TracelineResult<FieldMappings> {
        Ok(FieldMappings::default())
    }

    fn refresh(&self, _: &str) -> TracelineResult<()> {
        Ok(())
    }

    fn create_index(&self, _: &str) -> TracelineResult<()> {
        Ok(())
    }

    fn delete_index(&self, _: &str) -> TracelineResult<()> {
        Ok(())
    }
}
