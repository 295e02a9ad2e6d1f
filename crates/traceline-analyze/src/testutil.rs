//! Shared test fakes for the analyzers.

use std::sync::Mutex;

use serde_json::{Map, Value};

use traceline_core::{
    EventBackend, EventHit, FieldMappings, FlushReport, LabelUpdate, SearchHits, SearchRequest,
    SearchResponse, TracelineError, TracelineResult,
};

type ImportRecord = (String, Option<String>, Value, Option<i64>);

/// Backend fake for analyzer tests: serves canned hit pages and records
/// every mutation.
#[derive(Default)]
pub(crate) struct RecordingBackend {
    /// Hit pages; the first serves the search, the rest serve scrolls.
    pages: Mutex<Vec<Vec<Value>>>,
    searches: Mutex<Vec<SearchRequest>>,
    imports: Mutex<Vec<ImportRecord>>,
    labels: Mutex<Vec<LabelUpdate>>,
    refreshes: Mutex<Vec<String>>,
    flushes: Mutex<u64>,
}

impl RecordingBackend {
    /// Backend serving a single page of hits.
    pub(crate) fn with_hits(hits: Vec<Value>) -> Self {
        Self::with_pages(vec![hits])
    }

    /// Backend serving several scroll pages.
    pub(crate) fn with_pages(mut pages: Vec<Vec<Value>>) -> Self {
        pages.reverse();
        Self {
            pages: Mutex::new(pages),
            ..Self::default()
        }
    }

    pub(crate) fn imports(&self) -> Vec<ImportRecord> {
        self.imports.lock().unwrap().clone()
    }

    pub(crate) fn label_queue(&self) -> Vec<LabelUpdate> {
        self.labels.lock().unwrap().clone()
    }

    pub(crate) fn refreshes(&self) -> Vec<String> {
        self.refreshes.lock().unwrap().clone()
    }

    pub(crate) fn last_search(&self) -> Option<SearchRequest> {
        self.searches.lock().unwrap().last().cloned()
    }

    pub(crate) fn searches(&self) -> Vec<SearchRequest> {
        self.searches.lock().unwrap().clone()
    }

    pub(crate) fn flush_count(&self) -> u64 {
        *self.flushes.lock().unwrap()
    }

    fn next_page(&self) -> Vec<Value> {
        self.pages.lock().unwrap().pop().unwrap_or_default()
    }
}

impl EventBackend for RecordingBackend {
    fn search(&self, request: &SearchRequest) -> TracelineResult<SearchResponse> {
        self.searches.lock().unwrap().push(request.clone());
        let hits = self.next_page();
        Ok(SearchResponse {
            took: 1,
            scroll_id: Some("scroll-0".to_owned()),
            hits: SearchHits {
                total: hits.len() as u64,
                hits,
            },
            aggregations: None,
        })
    }

    fn scroll(&self, _id: &str, _keep_alive: &str) -> TracelineResult<SearchResponse> {
        let hits = self.next_page();
        Ok(SearchResponse {
            took: 1,
            scroll_id: Some("scroll-n".to_owned()),
            hits: SearchHits {
                total: hits.len() as u64,
                hits,
            },
            aggregations: None,
        })
    }

    fn count_events(&self, _indices: &[String]) -> TracelineResult<(u64, u64)> {
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
        index: &str,
        event_id: Option<&str>,
        event: Map<String, Value>,
        timeline_id: Option<i64>,
    ) -> TracelineResult<u64> {
        let mut imports = self.imports.lock().unwrap();
        imports.push((
            index.to_owned(),
            event_id.map(str::to_owned),
            Value::Object(event),
            timeline_id,
        ));
        Ok(imports.len() as u64)
    }

    fn flush_queued_events(&self) -> TracelineResult<FlushReport> {
        *self.flushes.lock().unwrap() += 1;
        Ok(FlushReport::default())
    }

    fn set_label(&self, update: &LabelUpdate) -> TracelineResult<()> {
        self.labels.lock().unwrap().push(update.clone());
        Ok(())
    }

    fn queue_label_update(&self, update: &LabelUpdate) -> TracelineResult<()> {
        self.labels.lock().unwrap().push(update.clone());
        Ok(())
    }

    fn field_mappings(&self, _indices: &[String]) -> TracelineResult<FieldMappings> {
        Ok(FieldMappings::default())
    }

    fn refresh(&self, index: &str) -> TracelineResult<()> {
        self.refreshes.lock().unwrap().push(index.to_owned());
        Ok(())
    }

    fn create_index(&self, _index: &str) -> TracelineResult<()> {
        Ok(())
    }

    fn delete_index(&self, _index: &str) -> TracelineResult<()> {
        Ok(())
    }
}
