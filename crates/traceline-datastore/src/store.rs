//! The index store: search, scroll, bulk import, and label updates.
//!
//! [`IndexStore`] is the production implementation of
//! [`traceline_core::EventBackend`] over an OpenSearch-compatible HTTP API.
//! All query construction is delegated to the pure builder in
//! `traceline-core`; this module owns wire paths, status interpretation,
//! and the bulk import buffer.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use traceline_core::query::build_query;
use traceline_core::{
    EventBackend, EventHit, FieldMappings, FlushReport, LabelUpdate, SearchRequest,
    SearchResponse, TracelineError, TracelineResult,
};

use crate::scripts::label_script;
use crate::transport::{
    BackendRequest, BackendResponse, HttpTransport, Method, Transport, TransportConfig,
};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Number of bulk actions to queue before an automatic flush.
pub const DEFAULT_FLUSH_INTERVAL: usize = 1000;

/// Maximum flush retries on transient failures.
pub const DEFAULT_FLUSH_RETRY_LIMIT: usize = 3;

/// Scroll keep-alive for the initial search of a scrolled result set.
const SEARCH_SCROLL_KEEP_ALIVE: &str = "1m";

// ─── Configuration ──────────────────────────────────────────────────────────

/// Settings for the index store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection settings.
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Bulk actions to queue before flushing automatically.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: usize,
    /// Flush retries on transient failures.
    #[serde(default = "default_flush_retry_limit")]
    pub flush_retry_limit: usize,
}

fn default_flush_interval() -> usize {
    DEFAULT_FLUSH_INTERVAL
}

fn default_flush_retry_limit() -> usize {
    DEFAULT_FLUSH_RETRY_LIMIT
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_retry_limit: DEFAULT_FLUSH_RETRY_LIMIT,
        }
    }
}

// ─── Label aggregation result ───────────────────────────────────────────────

/// One label name with its document count, from [`IndexStore::get_filter_labels`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCount {
    pub label: String,
    pub count: u64,
}

// ─── Bulk buffer ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BulkBuffer {
    /// Interleaved action headers and payloads, two entries per action.
    actions: Vec<Value>,
    /// Lifetime count of queued events.
    imported: u64,
}

// ─── Store ──────────────────────────────────────────────────────────────────

/// OpenSearch-compatible event store.
pub struct IndexStore {
    transport: Box<dyn Transport>,
    flush_interval: usize,
    flush_retry_limit: usize,
    buffer: Mutex<BulkBuffer>,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}

impl IndexStore {
    /// Connect to a backend over HTTP.
    pub fn connect(config: StoreConfig) -> TracelineResult<Self> {
        let transport = HttpTransport::new(config.transport.clone())?;
        Ok(Self::with_transport(Box::new(transport), &config))
    }

    /// Build a store over an arbitrary transport. This is the seam tests
    /// use to substitute canned responses.
    #[must_use]
    pub fn with_transport(transport: Box<dyn Transport>, config: &StoreConfig) -> Self {
        Self {
            transport,
            flush_interval: config.flush_interval.max(1),
            flush_retry_limit: config.flush_retry_limit,
            buffer: Mutex::new(BulkBuffer::default()),
        }
    }

    /// Count documents matching a request, via the `_count` API.
    ///
    /// Only the query part of the built document is sent; pagination, sort,
    /// and aggregations are meaningless for counting. A missing index
    /// counts as zero.
    pub fn search_count(&self, request: &SearchRequest) -> TracelineResult<u64> {
        if request.indices.is_empty() {
            return Ok(0);
        }
        let indices = dedupe(&request.indices);
        let built = build_query(
            request.sketch_id,
            request.query_string.as_deref(),
            &request.filter,
            request.query_dsl.as_ref(),
            None,
            request.timeline_ids.as_deref(),
        )?;
        let body = match built.get("query") {
            Some(query) => json!({"query": query}),
            None => json!({}),
        };
        let response = self.transport.execute(
            &BackendRequest::new(Method::Post, format!("{}/_count", indices.join(","))).json(body),
        )?;
        if response.status == 404 {
            error!(target: "traceline", indices = %indices.join(","), "count on missing index");
            return Ok(0);
        }
        let body = interpret("count", response, "index", &indices.join(","))?;
        Ok(body.get("count").and_then(Value::as_u64).unwrap_or(0))
    }

    /// Aggregate the label names used within a sketch.
    pub fn get_filter_labels(
        &self,
        sketch_id: i64,
        indices: &[String],
    ) -> TracelineResult<Vec<LabelCount>> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        let indices = dedupe(indices);

        // High bucket ceiling stands in for "all labels"; sketches with
        // more than this many labels get a truncated list.
        let max_labels = 10_000;
        let aggregation = json!({
            "size": 0,
            "aggs": {
                "nested": {
                    "nested": {"path": "timesketch_label"},
                    "aggs": {
                        "inner": {
                            "filter": {
                                "bool": {
                                    "must": [
                                        {"term": {"timesketch_label.sketch_id": sketch_id}}
                                    ]
                                }
                            },
                            "aggs": {
                                "labels": {
                                    "terms": {
                                        "size": max_labels,
                                        "field": "timesketch_label.name.keyword",
                                    }
                                }
                            },
                        }
                    },
                }
            }
        });

        let response = self.transport.execute(
            &BackendRequest::new(Method::Post, format!("{}/_search", indices.join(",")))
                .json(aggregation),
        )?;
        if response.status == 404 {
            error!(
                target: "traceline",
                indices = %indices.join(","),
                "label aggregation on missing index"
            );
            return Ok(Vec::new());
        }
        let body = interpret("aggregate", response, "index", &indices.join(","))?;

        let buckets = body
            .pointer("/aggregations/nested/inner/labels/buckets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(buckets
            .iter()
            .filter_map(|bucket| {
                Some(LabelCount {
                    label: bucket.get("key")?.as_str()?.to_owned(),
                    count: bucket.get("doc_count")?.as_u64()?,
                })
            })
            .collect())
    }

    /// Queued actions not yet flushed. Two buffer entries make one action.
    #[must_use]
    pub fn queued_actions(&self) -> usize {
        self.buffer.lock().map(|b| b.actions.len() / 2).unwrap_or(0)
    }

    fn queue_action(&self, header: Value, payload: Value) -> TracelineResult<u64> {
        let should_flush;
        let imported;
        {
            let mut buffer = self
                .buffer
                .lock()
                .map_err(|_| TracelineError::transient("import", "bulk buffer poisoned"))?;
            buffer.actions.push(header);
            buffer.actions.push(payload);
            buffer.imported += 1;
            imported = buffer.imported;
            should_flush = buffer.imported % self.flush_interval as u64 == 0;
        }
        if should_flush {
            self.flush_queued_events()?;
        }
        Ok(imported)
    }

    fn flush_once(&self, payload: &str) -> TracelineResult<BackendResponse> {
        self.transport
            .execute(&BackendRequest::new(Method::Post, "_bulk").ndjson(payload.to_owned()))
    }
}

fn dedupe(indices: &[String]) -> Vec<String> {
    let set: std::collections::BTreeSet<&String> = indices.iter().collect();
    set.into_iter().cloned().collect()
}

/// Interpret a backend response status in the context of one operation.
fn interpret(
    operation: &'static str,
    response: BackendResponse,
    not_found_kind: &'static str,
    not_found_id: &str,
) -> TracelineResult<Value> {
    if response.is_success() {
        return Ok(response.body);
    }
    match response.status {
        404 => Err(TracelineError::BackendNotFound {
            kind: not_found_kind,
            id: not_found_id.to_owned(),
        }),
        status if (400..500).contains(&status) => Err(TracelineError::bad_query(
            root_cause_summary(&response.body),
        )),
        status => Err(TracelineError::transient(
            operation,
            format!("HTTP {status}: {}", root_cause_summary(&response.body)),
        )),
    }
}

/// Condense a backend error body into the root-cause list.
fn root_cause_summary(body: &Value) -> String {
    let causes = body
        .pointer("/error/root_cause")
        .and_then(Value::as_array)
        .map(|causes| {
            causes
                .iter()
                .map(|cause| {
                    format!(
                        "[{}] {}",
                        cause.get("type").and_then(Value::as_str).unwrap_or(""),
                        cause.get("reason").and_then(Value::as_str).unwrap_or(""),
                    )
                })
                .collect::<Vec<_>>()
                .join(", ")
        });
    if let Some(summary) = causes.filter(|s| !s.is_empty()) {
        return summary;
    }
    if let Some(reason) = body.pointer("/error/reason").and_then(Value::as_str) {
        return reason.to_owned();
    }
    body.to_string()
}

fn error_type(body: &Value) -> Option<&str> {
    body.pointer("/error/type").and_then(Value::as_str)
}

/// Summarize bulk per-item failures by error signature.
///
/// The signature is the target index plus the error type, the caused-by
/// type, and the first five words of the caused-by reason, which collapses
/// thousands of identical mapper failures into one ledger line.
fn summarize_bulk_errors(items: &[Value]) -> BTreeMap<String, u64> {
    let mut signatures: BTreeMap<String, u64> = BTreeMap::new();

    for item in items {
        let action = item
            .get("index")
            .or_else(|| item.get("update"))
            .or_else(|| item.get("create"));
        let Some(action) = action else { continue };
        let Some(error) = action.get("error") else {
            continue;
        };

        let index = action
            .get("_index")
            .and_then(Value::as_str)
            .unwrap_or("unknown_index");
        let error_kind = error
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown_type");
        let caused_by = error.get("caused_by");
        let caused_type = caused_by
            .and_then(|c| c.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("unknown_cause");
        let caused_reason = caused_by
            .and_then(|c| c.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or("no reason given");
        let short_reason = caused_reason
            .split_whitespace()
            .take(5)
            .collect::<Vec<_>>()
            .join(" ");

        *signatures
            .entry(format!(
                "{index} <{error_kind}> {caused_type}/{short_reason}"
            ))
            .or_insert(0) += 1;
    }

    signatures
}

impl EventBackend for IndexStore {
    fn search(&self, request: &SearchRequest) -> TracelineResult<SearchResponse> {
        // No indices, no query: the UI routinely asks with nothing selected.
        if request.indices.is_empty() {
            return Ok(SearchResponse::empty());
        }
        let mut indices = dedupe(&request.indices);

        // Event-id filters pin the search to the indices those events
        // live in.
        if !request.filter.events.is_empty() {
            let event_indices: std::collections::BTreeSet<&String> = request
                .filter
                .events
                .iter()
                .map(|event| &event.index)
                .collect();
            indices.retain(|index| event_indices.contains(index));
            if indices.is_empty() {
                return Ok(SearchResponse::empty());
            }
        }

        let query = build_query(
            request.sketch_id,
            request.query_string.as_deref(),
            &request.filter,
            request.query_dsl.as_ref(),
            request.aggregations.as_ref(),
            request.timeline_ids.as_deref(),
        )?;

        let mut backend_request =
            BackendRequest::new(Method::Post, format!("{}/_search", indices.join(",")))
                .json(query);
        if request.enable_scroll {
            backend_request = backend_request.param("scroll", SEARCH_SCROLL_KEEP_ALIVE);
        }
        if let Some(fields) = &request.return_fields {
            backend_request = backend_request.param("_source_includes", fields.join(","));
        }

        debug!(
            target: "traceline",
            sketch_id = request.sketch_id,
            index = %indices.join(","),
            query_len = request.query_string.as_deref().map_or(0, str::len),
            "search"
        );

        let response = self.transport.execute(&backend_request)?;
        let body = interpret("search", response, "index", &indices.join(","))?;
        SearchResponse::from_value(body)
    }

    fn scroll(&self, scroll_id: &str, keep_alive: &str) -> TracelineResult<SearchResponse> {
        let response = self.transport.execute(
            &BackendRequest::new(Method::Post, "_search/scroll")
                .json(json!({"scroll": keep_alive, "scroll_id": scroll_id})),
        )?;
        if response.status == 404 {
            // An expired context clears server-side; re-running the search
            // gets a fresh one.
            return Err(TracelineError::transient(
                "scroll",
                "scroll context expired or missing".to_owned(),
            ));
        }
        let body = interpret("scroll", response, "index", scroll_id)?;
        SearchResponse::from_value(body)
    }

    fn count_events(&self, indices: &[String]) -> TracelineResult<(u64, u64)> {
        if indices.is_empty() {
            return Ok((0, 0));
        }
        let indices = dedupe(indices);
        let response = self.transport.execute(&BackendRequest::new(
            Method::Get,
            format!("{}/_stats/docs,store", indices.join(",")),
        ))?;
        if response.status == 404 {
            error!(target: "traceline", indices = %indices.join(","), "stats on missing index");
            return Ok((0, 0));
        }
        let body = interpret("stats", response, "index", &indices.join(","))?;
        let docs = body
            .pointer("/_all/primaries/docs/count")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let bytes = body
            .pointer("/_all/primaries/store/size_in_bytes")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok((docs, bytes))
    }

    fn get_event(&self, index: &str, event_id: &str) -> TracelineResult<EventHit> {
        let response = self.transport.execute(
            &BackendRequest::new(Method::Get, format!("{index}/_doc/{event_id}"))
                .param("_source_excludes", traceline_core::LABEL_FIELD),
        )?;
        let body = interpret(
            "get_event",
            response,
            "document",
            &format!("{index}/{event_id}"),
        )?;
        EventHit::from_value(body)
    }

    fn import_event(
        &self,
        index: &str,
        event_id: Option<&str>,
        event: Map<String, Value>,
        timeline_id: Option<i64>,
    ) -> TracelineResult<u64> {
        let mut event = event;
        if let Some(timeline_id) = timeline_id {
            event.insert("__ts_timeline_id".to_owned(), json!(timeline_id));
        }

        let (header, payload) = match event_id {
            Some(id) => (
                json!({"update": {"_index": index, "_id": id}}),
                json!({"doc": event}),
            ),
            None => (
                json!({"index": {"_index": index}}),
                Value::Object(event),
            ),
        };
        self.queue_action(header, payload)
    }

    fn flush_queued_events(&self) -> TracelineResult<FlushReport> {
        let (actions, total) = {
            let mut buffer = self
                .buffer
                .lock()
                .map_err(|_| TracelineError::transient("flush", "bulk buffer poisoned"))?;
            (std::mem::take(&mut buffer.actions), buffer.imported)
        };
        if actions.is_empty() {
            return Ok(FlushReport {
                sent: 0,
                total_imported: total,
                ..FlushReport::default()
            });
        }

        let mut payload = String::new();
        for action in &actions {
            payload.push_str(&serde_json::to_string(action)?);
            payload.push('\n');
        }

        let mut attempt = 0;
        let response = loop {
            match self.flush_once(&payload) {
                Ok(response) => break response,
                Err(e) if e.is_retryable() && attempt < self.flush_retry_limit => {
                    attempt += 1;
                    warn!(
                        target: "traceline",
                        attempt,
                        limit = self.flush_retry_limit,
                        "bulk flush failed, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        };

        let body = interpret("flush", response, "index", "_bulk")?;
        let sent = (actions.len() / 2) as u64;

        let mut report = FlushReport {
            sent,
            total_imported: total,
            ..FlushReport::default()
        };

        // Item-level rejections never fail the batch: accepted actions
        // stand and the rejections accumulate in the report.
        if body.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            let items = body
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            report.error_container = summarize_bulk_errors(&items);
            report.errors_in_upload = !report.error_container.is_empty();
            if let Some(item_error) = report.item_error() {
                error!(
                    target: "traceline",
                    action_count = sent,
                    dropped_count = report.dropped(),
                    summary = %item_error,
                    "bulk flush dropped actions"
                );
            }
        }

        debug!(target: "traceline", action_count = sent, "bulk flush complete");
        Ok(report)
    }

    fn set_label(&self, update: &LabelUpdate) -> TracelineResult<()> {
        // Initialize the label list on documents that predate labeling;
        // the painless script expects the field to be addressable.
        let doc = self.transport.execute(&BackendRequest::new(
            Method::Get,
            format!("{}/_doc/{}", update.index, update.event_id),
        ))?;
        let doc = interpret(
            "set_label",
            doc,
            "document",
            &format!("{}/{}", update.index, update.event_id),
        )?;
        if doc.pointer("/_source/timesketch_label").is_none() {
            let init = self.transport.execute(
                &BackendRequest::new(
                    Method::Post,
                    format!("{}/_update/{}", update.index, update.event_id),
                )
                .json(json!({"doc": {"timesketch_label": []}})),
            )?;
            interpret("set_label", init, "document", &update.event_id)?;
        }

        let response = self.transport.execute(
            &BackendRequest::new(
                Method::Post,
                format!("{}/_update/{}", update.index, update.event_id),
            )
            .json(json!({"script": label_script(update)})),
        )?;
        interpret("set_label", response, "document", &update.event_id)?;
        Ok(())
    }

    fn queue_label_update(&self, update: &LabelUpdate) -> TracelineResult<()> {
        let header = json!({"update": {"_index": update.index, "_id": update.event_id}});
        let payload = json!({"script": label_script(update)});
        self.queue_action(header, payload)?;
        Ok(())
    }

    fn field_mappings(&self, indices: &[String]) -> TracelineResult<FieldMappings> {
        if indices.is_empty() {
            return Ok(FieldMappings::default());
        }
        let indices = dedupe(indices);
        let response = self.transport.execute(&BackendRequest::new(
            Method::Get,
            format!("{}/_mapping", indices.join(",")),
        ))?;
        let body = interpret("mapping", response, "index", &indices.join(","))?;
        Ok(FieldMappings::from_mapping_response(&body))
    }

    fn refresh(&self, index: &str) -> TracelineResult<()> {
        let response = self
            .transport
            .execute(&BackendRequest::new(Method::Post, format!("{index}/_refresh")))?;
        interpret("refresh", response, "index", index)?;
        Ok(())
    }

    fn create_index(&self, index: &str) -> TracelineResult<()> {
        let mappings = json!({
            "mappings": {
                "properties": {
                    "timesketch_label": {"type": "nested"},
                    "datetime": {"type": "date"},
                }
            }
        });
        let response = self
            .transport
            .execute(&BackendRequest::new(Method::Put, index.to_owned()).json(mappings))?;
        if response.is_success() {
            return Ok(());
        }
        // Lost the creation race: someone else made it, which is fine.
        if error_type(&response.body) == Some("resource_already_exists_exception") {
            warn!(target: "traceline", index, "index already exists");
            return Ok(());
        }
        interpret("create_index", response, "index", index)?;
        Ok(())
    }

    fn delete_index(&self, index: &str) -> TracelineResult<()> {
        let response = self
            .transport
            .execute(&BackendRequest::new(Method::Delete, index.to_owned()))?;
        if response.status == 404 {
            return Ok(());
        }
        interpret("delete_index", response, "index", index)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Body;
    use std::collections::VecDeque;
    use traceline_core::{LabelOp, QueryFilter};

    /// Transport that replays canned responses and records every request.
    struct FakeTransport {
        responses: Mutex<VecDeque<BackendResponse>>,
        requests: Mutex<Vec<BackendRequest>>,
    }

    impl FakeTransport {
        fn new(responses: Vec<BackendResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn recorded(&self) -> Vec<BackendRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Transport for FakeTransport {
        fn execute(&self, request: &BackendRequest) -> TracelineResult<BackendResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TracelineError::transient("request", "no canned response"))
        }
    }

    fn ok(body: Value) -> BackendResponse {
        BackendResponse { status: 200, body }
    }

    fn store_with(responses: Vec<BackendResponse>) -> (IndexStore, std::sync::Arc<FakeTransport>) {
        let transport = std::sync::Arc::new(FakeTransport::new(responses));
        let store = IndexStore {
            transport: Box::new(SharedTransport(transport.clone())),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_retry_limit: DEFAULT_FLUSH_RETRY_LIMIT,
            buffer: Mutex::new(BulkBuffer::default()),
        };
        (store, transport)
    }

    /// Arc wrapper so tests can keep inspecting the fake after handing it
    /// to the store.
    struct SharedTransport(std::sync::Arc<FakeTransport>);

    impl Transport for SharedTransport {
        fn execute(&self, request: &BackendRequest) -> TracelineResult<BackendResponse> {
            self.0.execute(request)
        }
    }

    fn search_body() -> Value {
        json!({
            "took": 2,
            "hits": {"total": {"value": 1, "relation": "eq"}, "hits": [
                {"_id": "e1", "_index": "idx", "_source": {"message": "hi"}}
            ]},
        })
    }

    // ── Search ──────────────────────────────────────────────────────────────

    #[test]
    fn empty_index_list_short_circuits() {
        let (store, transport) = store_with(vec![]);
        let response = store.search(&SearchRequest::new(1, vec![])).expect("search");
        assert_eq!(response.hits.total, 0);
        assert!(transport.recorded().is_empty(), "no request must be sent");
    }

    #[test]
    fn search_posts_to_joined_indices() {
        let (store, transport) = store_with(vec![ok(search_body())]);
        let request = SearchRequest::new(1, vec!["b".to_owned(), "a".to_owned(), "a".to_owned()])
            .with_query_string("*");
        store.search(&request).expect("search");
        let sent = transport.recorded();
        assert_eq!(sent[0].path, "a,b/_search", "indices deduped and sorted");
    }

    #[test]
    fn scrolled_search_sets_scroll_param() {
        let (store, transport) = store_with(vec![ok(search_body())]);
        let request = SearchRequest::new(1, vec!["idx".to_owned()])
            .with_query_string("*")
            .with_scroll();
        store.search(&request).expect("search");
        assert!(transport.recorded()[0]
            .params
            .contains(&("scroll".to_owned(), "1m".to_owned())));
    }

    #[test]
    fn return_fields_become_source_includes() {
        let (store, transport) = store_with(vec![ok(search_body())]);
        let request = SearchRequest::new(1, vec!["idx".to_owned()])
            .with_query_string("*")
            .with_return_fields(vec!["message".to_owned(), "tag".to_owned()]);
        store.search(&request).expect("search");
        assert!(transport.recorded()[0]
            .params
            .contains(&("_source_includes".to_owned(), "message,tag".to_owned())));
    }

    #[test]
    fn event_filter_restricts_indices() {
        let (store, transport) = store_with(vec![ok(search_body())]);
        let mut request = SearchRequest::new(
            1,
            vec!["idx1".to_owned(), "idx2".to_owned()],
        );
        request.filter.events = vec![traceline_core::EventRef {
            event_id: "e1".to_owned(),
            index: "idx2".to_owned(),
        }];
        store.search(&request).expect("search");
        assert_eq!(transport.recorded()[0].path, "idx2/_search");
    }

    #[test]
    fn search_400_is_bad_query_with_root_cause() {
        let (store, _transport) = store_with(vec![BackendResponse {
            status: 400,
            body: json!({"error": {"root_cause": [
                {"type": "parse_exception", "reason": "unbalanced quote"}
            ]}}),
        }]);
        let err = store
            .search(&SearchRequest::new(1, vec!["idx".to_owned()]).with_query_string("\"oops"))
            .unwrap_err();
        match err {
            TracelineError::BadQuery { detail } => {
                assert!(detail.contains("parse_exception"));
                assert!(detail.contains("unbalanced quote"));
            }
            other => panic!("expected BadQuery, got {other:?}"),
        }
    }

    #[test]
    fn search_404_is_index_not_found() {
        let (store, _transport) = store_with(vec![BackendResponse {
            status: 404,
            body: Value::Null,
        }]);
        let err = store
            .search(&SearchRequest::new(1, vec!["gone".to_owned()]).with_query_string("*"))
            .unwrap_err();
        assert!(matches!(
            err,
            TracelineError::BackendNotFound { kind: "index", .. }
        ));
    }

    #[test]
    fn search_5xx_is_transient() {
        let (store, _transport) = store_with(vec![BackendResponse {
            status: 503,
            body: Value::Null,
        }]);
        let err = store
            .search(&SearchRequest::new(1, vec!["idx".to_owned()]).with_query_string("*"))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    // ── Scroll ──────────────────────────────────────────────────────────────

    #[test]
    fn scroll_expiry_is_transient() {
        let (store, _transport) = store_with(vec![BackendResponse {
            status: 404,
            body: Value::Null,
        }]);
        let err = store.scroll("stale", "5m").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn scroll_posts_keep_alive() {
        let (store, transport) = store_with(vec![ok(search_body())]);
        store.scroll("sid", "5m").expect("scroll");
        let sent = transport.recorded();
        assert_eq!(sent[0].path, "_search/scroll");
        match &sent[0].body {
            Some(Body::Json(body)) => {
                assert_eq!(body["scroll"], json!("5m"));
                assert_eq!(body["scroll_id"], json!("sid"));
            }
            other => panic!("expected JSON body, got {other:?}"),
        }
    }

    // ── Counting ────────────────────────────────────────────────────────────

    #[test]
    fn count_events_reads_primaries_stats() {
        let (store, _transport) = store_with(vec![ok(json!({
            "_all": {"primaries": {"docs": {"count": 123}, "store": {"size_in_bytes": 4096}}}
        }))]);
        let (docs, bytes) = store.count_events(&["idx".to_owned()]).expect("count");
        assert_eq!(docs, 123);
        assert_eq!(bytes, 4096);
    }

    #[test]
    fn count_missing_index_is_zero() {
        let (store, _transport) = store_with(vec![BackendResponse {
            status: 404,
            body: Value::Null,
        }]);
        assert_eq!(store.count_events(&["gone".to_owned()]).unwrap(), (0, 0));
    }

    #[test]
    fn search_count_sends_query_only() {
        let (store, transport) = store_with(vec![ok(json!({"count": 9}))]);
        let request = SearchRequest::new(1, vec!["idx".to_owned()])
            .with_query_string("*")
            .with_filter(QueryFilter::with_size(50));
        assert_eq!(store.search_count(&request).unwrap(), 9);
        match &transport.recorded()[0].body {
            Some(Body::Json(body)) => {
                assert!(body.get("query").is_some());
                assert!(body.get("size").is_none(), "_count rejects size");
                assert!(body.get("sort").is_none(), "_count rejects sort");
            }
            other => panic!("expected JSON body, got {other:?}"),
        }
    }

    // ── Get event ───────────────────────────────────────────────────────────

    #[test]
    fn get_event_excludes_label_field() {
        let (store, transport) = store_with(vec![ok(json!({
            "_id": "e1", "_index": "idx", "_source": {"message": "x"}
        }))]);
        let hit = store.get_event("idx", "e1").expect("get");
        assert_eq!(hit.id, "e1");
        assert!(transport.recorded()[0]
            .params
            .contains(&("_source_excludes".to_owned(), "timesketch_label".to_owned())));
    }

    #[test]
    fn get_missing_event_is_not_found() {
        let (store, _transport) = store_with(vec![BackendResponse {
            status: 404,
            body: Value::Null,
        }]);
        let err = store.get_event("idx", "nope").unwrap_err();
        assert!(matches!(
            err,
            TracelineError::BackendNotFound {
                kind: "document",
                ..
            }
        ));
    }

    // ── Bulk import ─────────────────────────────────────────────────────────

    fn event(message: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("message".to_owned(), json!(message));
        map
    }

    #[test]
    fn import_buffers_without_flushing() {
        let (store, transport) = store_with(vec![]);
        store
            .import_event("idx", None, event("a"), None)
            .expect("import");
        store
            .import_event("idx", None, event("b"), Some(4))
            .expect("import");
        assert_eq!(store.queued_actions(), 2);
        assert!(transport.recorded().is_empty(), "nothing flushed yet");
    }

    #[test]
    fn import_reaching_interval_flushes() {
        let transport = std::sync::Arc::new(FakeTransport::new(vec![ok(
            json!({"errors": false, "items": []}),
        )]));
        let store = IndexStore {
            transport: Box::new(SharedTransport(transport.clone())),
            flush_interval: 2,
            flush_retry_limit: 0,
            buffer: Mutex::new(BulkBuffer::default()),
        };
        store.import_event("idx", None, event("a"), None).unwrap();
        store.import_event("idx", None, event("b"), None).unwrap();
        assert_eq!(store.queued_actions(), 0);
        assert_eq!(transport.recorded().len(), 1);
        assert_eq!(transport.recorded()[0].path, "_bulk");
    }

    #[test]
    fn flush_builds_ndjson_action_pairs() {
        let (store, transport) = store_with(vec![ok(json!({"errors": false, "items": []}))]);
        store
            .import_event("idx", Some("e9"), event("update me"), Some(2))
            .unwrap();
        let report = store.flush_queued_events().expect("flush");
        assert_eq!(report.sent, 1);

        match &transport.recorded()[0].body {
            Some(Body::NdJson(text)) => {
                let lines: Vec<&str> = text.lines().collect();
                assert_eq!(lines.len(), 2);
                let header: Value = serde_json::from_str(lines[0]).unwrap();
                let payload: Value = serde_json::from_str(lines[1]).unwrap();
                assert_eq!(header["update"]["_id"], json!("e9"));
                assert_eq!(payload["doc"]["message"], json!("update me"));
                assert_eq!(payload["doc"]["__ts_timeline_id"], json!(2));
            }
            other => panic!("expected NDJSON body, got {other:?}"),
        }
    }

    #[test]
    fn flush_with_empty_buffer_is_a_no_op() {
        let (store, transport) = store_with(vec![]);
        let report = store.flush_queued_events().expect("flush");
        assert_eq!(report.sent, 0);
        assert!(transport.recorded().is_empty());
    }

    #[test]
    fn flush_summarizes_item_errors() {
        let (store, _transport) = store_with(vec![ok(json!({
            "errors": true,
            "items": [
                {"index": {"_index": "idx", "status": 400, "error": {
                    "type": "mapper_parsing_exception",
                    "reason": "failed to parse field [datetime]",
                    "caused_by": {"type": "illegal_argument_exception",
                                  "reason": "Invalid format: \"not a date\" is malformed at \"a date\""},
                }}},
                {"index": {"_index": "idx", "status": 201}},
                {"index": {"_index": "idx", "status": 400, "error": {
                    "type": "mapper_parsing_exception",
                    "reason": "failed to parse field [datetime]",
                    "caused_by": {"type": "illegal_argument_exception",
                                  "reason": "Invalid format: \"not a date\" is malformed at \"a date\""},
                }}},
            ],
        }))]);
        store.import_event("idx", None, event("x"), None).unwrap();
        let report = store.flush_queued_events().expect("item errors never fail the flush");
        assert!(report.errors_in_upload);
        assert_eq!(report.dropped(), 2);
        assert_eq!(
            report.error_container.len(),
            1,
            "identical failures collapse into one signature"
        );
        let (signature, count) = report.error_container.iter().next().unwrap();
        assert_eq!(*count, 2);
        assert!(signature.starts_with("idx "), "keyed by index: {signature}");
        assert!(signature.contains("mapper_parsing_exception"));
        assert!(
            signature.contains("illegal_argument_exception/Invalid format: \"not a"),
            "signature keeps first five words of the cause: {signature}"
        );

        let err = report.item_error().expect("collapsible error");
        assert!(err.to_string().starts_with("2 events failed:"));
    }

    #[test]
    fn flush_retries_transient_failures() {
        // First two attempts fail at transport level, third succeeds.
        struct FlakyTransport {
            failures_left: Mutex<usize>,
        }
        impl Transport for FlakyTransport {
            fn execute(&self, _request: &BackendRequest) -> TracelineResult<BackendResponse> {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(TracelineError::transient("request", "timed out"));
                }
                Ok(ok(json!({"errors": false, "items": []})))
            }
        }
        let store = IndexStore {
            transport: Box::new(FlakyTransport {
                failures_left: Mutex::new(2),
            }),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_retry_limit: 3,
            buffer: Mutex::new(BulkBuffer::default()),
        };
        store.import_event("idx", None, event("x"), None).unwrap();
        let report = store.flush_queued_events().expect("flush succeeds on retry");
        assert_eq!(report.sent, 1);
    }

    // ── Labels ──────────────────────────────────────────────────────────────

    fn label_update(op: LabelOp) -> LabelUpdate {
        LabelUpdate {
            index: "idx".to_owned(),
            event_id: "e1".to_owned(),
            sketch_id: 1,
            user_id: 2,
            label: "__ts_star".to_owned(),
            op,
        }
    }

    #[test]
    fn set_label_initializes_missing_label_list() {
        let (store, transport) = store_with(vec![
            ok(json!({"_id": "e1", "_index": "idx", "_source": {"message": "x"}})),
            ok(json!({"result": "updated"})),
            ok(json!({"result": "updated"})),
        ]);
        store.set_label(&label_update(LabelOp::Add)).expect("label");
        let sent = transport.recorded();
        assert_eq!(sent.len(), 3, "get, init, script update");
        match &sent[1].body {
            Some(Body::Json(body)) => {
                assert_eq!(body["doc"]["timesketch_label"], json!([]));
            }
            other => panic!("expected JSON init body, got {other:?}"),
        }
        match &sent[2].body {
            Some(Body::Json(body)) => assert!(body["script"]["source"].is_string()),
            other => panic!("expected JSON script body, got {other:?}"),
        }
    }

    #[test]
    fn set_label_skips_init_when_list_exists() {
        let (store, transport) = store_with(vec![
            ok(json!({"_id": "e1", "_index": "idx",
                      "_source": {"timesketch_label": [], "message": "x"}})),
            ok(json!({"result": "updated"})),
        ]);
        store
            .set_label(&label_update(LabelOp::Toggle))
            .expect("label");
        assert_eq!(transport.recorded().len(), 2, "get, script update");
    }

    #[test]
    fn queued_label_update_lands_in_bulk_buffer() {
        let (store, transport) = store_with(vec![ok(json!({"errors": false, "items": []}))]);
        store
            .queue_label_update(&label_update(LabelOp::Add))
            .expect("queue");
        assert_eq!(store.queued_actions(), 1);
        store.flush_queued_events().expect("flush");
        match &transport.recorded()[0].body {
            Some(Body::NdJson(text)) => {
                let payload: Value = serde_json::from_str(text.lines().nth(1).unwrap()).unwrap();
                assert_eq!(payload["script"]["lang"], json!("painless"));
            }
            other => panic!("expected NDJSON, got {other:?}"),
        }
    }

    // ── Index lifecycle ─────────────────────────────────────────────────────

    #[test]
    fn create_index_sends_default_mapping() {
        let (store, transport) = store_with(vec![ok(json!({"acknowledged": true}))]);
        store.create_index("sketch_9").expect("create");
        let sent = transport.recorded();
        assert_eq!(sent[0].method, Method::Put);
        assert_eq!(sent[0].path, "sketch_9");
        match &sent[0].body {
            Some(Body::Json(body)) => {
                assert_eq!(
                    body["mappings"]["properties"]["timesketch_label"]["type"],
                    json!("nested")
                );
                assert_eq!(
                    body["mappings"]["properties"]["datetime"]["type"],
                    json!("date")
                );
            }
            other => panic!("expected JSON body, got {other:?}"),
        }
    }

    #[test]
    fn create_existing_index_is_ok() {
        let (store, _transport) = store_with(vec![BackendResponse {
            status: 400,
            body: json!({"error": {"type": "resource_already_exists_exception",
                                   "reason": "index already exists"}}),
        }]);
        store.create_index("sketch_9").expect("idempotent create");
    }

    #[test]
    fn delete_missing_index_is_ok() {
        let (store, _transport) = store_with(vec![BackendResponse {
            status: 404,
            body: Value::Null,
        }]);
        store.delete_index("gone").expect("idempotent delete");
    }

    // ── Label aggregation ───────────────────────────────────────────────────

    #[test]
    fn filter_labels_parse_buckets() {
        let (store, _transport) = store_with(vec![ok(json!({
            "aggregations": {"nested": {"inner": {"labels": {"buckets": [
                {"key": "__ts_star", "doc_count": 12},
                {"key": "case1", "doc_count": 3},
            ]}}}}
        }))]);
        let labels = store
            .get_filter_labels(1, &["idx".to_owned()])
            .expect("labels");
        assert_eq!(
            labels,
            vec![
                LabelCount {
                    label: "__ts_star".to_owned(),
                    count: 12
                },
                LabelCount {
                    label: "case1".to_owned(),
                    count: 3
                },
            ]
        );
    }

    #[test]
    fn filter_labels_empty_indices_short_circuits() {
        let (store, transport) = store_with(vec![]);
        assert!(store.get_filter_labels(1, &[]).unwrap().is_empty());
        assert!(transport.recorded().is_empty());
    }

    // ── Field mappings ──────────────────────────────────────────────────────

    #[test]
    fn field_mappings_flatten_response() {
        let (store, _transport) = store_with(vec![ok(json!({
            "idx": {"mappings": {"properties": {
                "message": {"type": "text"},
                "timestamp": {"type": "long"},
            }}}
        }))]);
        let mappings = store.field_mappings(&["idx".to_owned()]).expect("mapping");
        assert_eq!(mappings.format_field("message"), "message.keyword");
        assert_eq!(mappings.format_field("timestamp"), "timestamp");
    }
}
