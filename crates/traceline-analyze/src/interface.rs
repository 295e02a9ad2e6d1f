//! Analyzer plugin interface: the event handle, the event stream, and the
//! [`Analyzer`] trait.
//!
//! An [`Event`] is a handle over one hit with a staged mutation buffer.
//! Analyzers stage attributes, tags, emojis, and labels while they reason
//! over the stream; [`Event::commit`] pushes the staged state into the
//! backend's bulk buffer. Nothing touches the wire until the analyzer
//! framework flushes.

use serde_json::{json, Map, Value};
use tracing::debug;

use traceline_core::{
    CancelToken, EventBackend, EventHit, HitStream, LabelOp, LabelUpdate, SearchRequest,
    TracelineError, TracelineResult, TIMELINE_ID_FIELD,
};

/// Label marking starred events.
pub const STAR_LABEL: &str = "__ts_star";
/// Label marking commented events.
pub const COMMENT_LABEL: &str = "__ts_comment";
/// Attribute carrying emoji annotations.
pub const EMOJI_FIELD: &str = "__ts_emojis";

/// Source fields every analyzer stream fetches on top of its own list.
const IMPLICIT_RETURN_FIELDS: &[&str] = &["tag", "human_readable", EMOJI_FIELD];

// ─── Event handle ───────────────────────────────────────────────────────────

/// One event under analysis, with staged mutations.
pub struct Event<'a> {
    backend: &'a dyn EventBackend,
    sketch_id: i64,
    user_id: i64,
    /// Document id.
    pub id: String,
    /// Index the event lives in.
    pub index: String,
    /// Timeline the event belongs to, when imported through one.
    pub timeline_id: Option<i64>,
    /// Source fields as fetched; merged with staged state on commit.
    pub source: Map<String, Value>,
    staged: Map<String, Value>,
    staged_labels: Vec<(String, LabelOp)>,
}

impl<'a> Event<'a> {
    /// Build a handle from a raw hit document.
    pub fn from_hit(
        backend: &'a dyn EventBackend,
        sketch_id: i64,
        user_id: i64,
        hit: Value,
    ) -> TracelineResult<Self> {
        let hit = EventHit::from_value(hit)?;
        let timeline_id = hit.source_i64(TIMELINE_ID_FIELD);
        Ok(Self {
            backend,
            sketch_id,
            user_id,
            id: hit.id,
            index: hit.index,
            timeline_id,
            source: hit.source,
            staged: Map::new(),
            staged_labels: Vec::new(),
        })
    }

    /// A source field, staged value taking precedence.
    #[must_use]
    pub fn attribute(&self, field: &str) -> Option<&Value> {
        self.staged.get(field).or_else(|| self.source.get(field))
    }

    /// A source field as a string slice, staged value taking precedence.
    #[must_use]
    pub fn attribute_str(&self, field: &str) -> Option<&str> {
        self.attribute(field).and_then(Value::as_str)
    }

    /// A source field as an integer, staged value taking precedence.
    #[must_use]
    pub fn attribute_i64(&self, field: &str) -> Option<i64> {
        self.attribute(field).and_then(Value::as_i64)
    }

    /// Stage attribute updates.
    pub fn add_attributes(&mut self, attributes: Map<String, Value>) {
        self.staged.extend(attributes);
    }

    fn string_list(&self, field: &str) -> Vec<String> {
        self.attribute(field)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn union_into(&mut self, field: &str, additions: &[&str]) {
        let mut list = self.string_list(field);
        for addition in additions {
            if !list.iter().any(|existing| existing == addition) {
                list.push((*addition).to_owned());
            }
        }
        self.staged.insert(field.to_owned(), json!(list));
    }

    /// Stage tags, unioned with the event's existing tags.
    pub fn add_tags(&mut self, tags: &[&str]) {
        self.union_into("tag", tags);
    }

    /// Stage emoji annotations, unioned with existing ones.
    pub fn add_emojis(&mut self, emojis: &[&str]) {
        self.union_into(EMOJI_FIELD, emojis);
    }

    /// Stage a human-readable annotation, prefixed with the analyzer name.
    /// Duplicate entries are dropped; `prepend` puts the entry first.
    pub fn add_human_readable(&mut self, analyzer: &str, text: &str, prepend: bool) {
        let entry = format!("[{analyzer}] {text}");
        let mut list = self.string_list("human_readable");
        if list.contains(&entry) {
            return;
        }
        if prepend {
            list.insert(0, entry);
        } else {
            list.push(entry);
        }
        self.staged.insert("human_readable".to_owned(), json!(list));
    }

    /// Queue a label operation for commit.
    pub fn add_label(&mut self, label: &str) {
        self.staged_labels.push((label.to_owned(), LabelOp::Add));
    }

    /// Queue a label removal for commit.
    pub fn remove_label(&mut self, label: &str) {
        self.staged_labels.push((label.to_owned(), LabelOp::Remove));
    }

    /// Queue a label toggle for commit.
    pub fn toggle_label(&mut self, label: &str) {
        self.staged_labels.push((label.to_owned(), LabelOp::Toggle));
    }

    /// Star the event.
    pub fn add_star(&mut self) {
        self.add_label(STAR_LABEL);
    }

    /// Stage a comment and mark the event as commented.
    pub fn add_comment(&mut self, comment: &str) {
        let mut comments = self.string_list("comment");
        comments.push(comment.to_owned());
        self.staged.insert("comment".to_owned(), json!(comments));
        self.add_label(COMMENT_LABEL);
    }

    /// Staged state pending commit?
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.staged.is_empty() || !self.staged_labels.is_empty()
    }

    /// Push staged attributes and labels into the backend's bulk buffer.
    ///
    /// Staged attributes merge into the local source so later reads within
    /// the same run see the updated state.
    pub fn commit(&mut self) -> TracelineResult<()> {
        if !self.staged.is_empty() {
            let staged = std::mem::take(&mut self.staged);
            self.backend
                .import_event(&self.index, Some(&self.id), staged.clone(), self.timeline_id)?;
            self.source.extend(staged);
        }
        for (label, op) in std::mem::take(&mut self.staged_labels) {
            self.backend.queue_label_update(&LabelUpdate {
                index: self.index.clone(),
                event_id: self.id.clone(),
                sketch_id: self.sketch_id,
                user_id: self.user_id,
                label,
                op,
            })?;
        }
        Ok(())
    }
}

// ─── Analyzer context ───────────────────────────────────────────────────────

/// What to stream for one analyzer pass.
#[derive(Debug, Default, Clone)]
pub struct EventStreamSpec {
    /// Query string; either this or `query_dsl` must be set.
    pub query_string: Option<String>,
    /// Full query DSL; overrides `query_string`.
    pub query_dsl: Option<Value>,
    /// Source fields to fetch. `None` fetches just `message` plus the
    /// implicit annotation fields.
    pub return_fields: Option<Vec<String>>,
}

impl EventStreamSpec {
    /// Stream events matching a query string.
    #[must_use]
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query_string: Some(query.into()),
            ..Self::default()
        }
    }

    /// Set the source fields to fetch.
    #[must_use]
    pub fn with_return_fields(mut self, fields: &[&str]) -> Self {
        self.return_fields = Some(fields.iter().map(|f| (*f).to_owned()).collect());
        self
    }
}

/// Everything an analyzer needs to run against one timeline.
pub struct AnalyzerContext<'a> {
    /// Backend to stream from and commit to.
    pub backend: &'a dyn EventBackend,
    /// Sketch the analysis belongs to.
    pub sketch_id: i64,
    /// User the analysis runs as; recorded on label updates.
    pub user_id: i64,
    /// Index holding the timeline.
    pub index: String,
    /// Timeline to scope the stream to, when the index holds several.
    pub timeline_id: Option<i64>,
    /// Cancellation flag, polled between streamed events. Writes committed
    /// before a cancellation is observed are retained.
    pub cancel: CancelToken,
}

impl<'a> AnalyzerContext<'a> {
    #[must_use]
    pub fn new(backend: &'a dyn EventBackend, sketch_id: i64, index: impl Into<String>) -> Self {
        Self {
            backend,
            sketch_id,
            user_id: 0,
            index: index.into(),
            timeline_id: None,
            cancel: CancelToken::new(),
        }
    }

    /// Attach a shared cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Open an event stream for one analyzer pass.
    ///
    /// The index is refreshed first so the pass sees writes committed by
    /// earlier analyzers in the same pipeline.
    pub fn event_stream(
        &self,
        analyzer: &str,
        spec: EventStreamSpec,
    ) -> TracelineResult<EventStream<'a>> {
        if spec.query_string.is_none() && spec.query_dsl.is_none() {
            return Err(TracelineError::AnalyzerValidation {
                analyzer: analyzer.to_owned(),
                detail: "event stream needs a query string or query DSL".to_owned(),
            });
        }

        let mut return_fields = spec
            .return_fields
            .unwrap_or_else(|| vec!["message".to_owned()]);
        for implicit in IMPLICIT_RETURN_FIELDS {
            if !return_fields.iter().any(|f| f == implicit) {
                return_fields.push((*implicit).to_owned());
            }
        }

        self.backend.refresh(&self.index)?;

        let mut request = SearchRequest::new(self.sketch_id, vec![self.index.clone()])
            .with_return_fields(return_fields)
            .with_scroll();
        request.query_string = spec.query_string;
        request.query_dsl = spec.query_dsl;
        request.timeline_ids = self.timeline_id.map(|id| vec![id]);

        debug!(
            target: "traceline",
            analyzer,
            sketch_id = self.sketch_id,
            index = %self.index,
            "opening event stream"
        );

        Ok(EventStream {
            inner: HitStream::open(self.backend, request)?,
            backend: self.backend,
            sketch_id: self.sketch_id,
            user_id: self.user_id,
            cancel: self.cancel.clone(),
            cancel_reported: false,
        })
    }
}

/// Iterator of [`Event`] handles over a hit stream.
///
/// Polls the context's cancellation token before every hit; an observed
/// cancellation yields one [`TracelineError::Cancelled`] and then ends the
/// stream.
pub struct EventStream<'a> {
    inner: HitStream<'a>,
    backend: &'a dyn EventBackend,
    sketch_id: i64,
    user_id: i64,
    cancel: CancelToken,
    cancel_reported: bool,
}

impl std::fmt::Debug for EventStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("sketch_id", &self.sketch_id)
            .field("user_id", &self.user_id)
            .field("cancel_reported", &self.cancel_reported)
            .finish_non_exhaustive()
    }
}

impl<'a> EventStream<'a> {
    /// Total hits reported by the initial search.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.inner.total()
    }
}

impl<'a> Iterator for EventStream<'a> {
    type Item = TracelineResult<Event<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancel.is_cancelled() {
            if self.cancel_reported {
                return None;
            }
            self.cancel_reported = true;
            return Some(Err(TracelineError::Cancelled {
                operation: "event stream".to_owned(),
            }));
        }
        let hit = self.inner.next()?;
        Some(hit.and_then(|hit| {
            Event::from_hit(self.backend, self.sketch_id, self.user_id, hit)
        }))
    }
}

// ─── Analyzer trait ─────────────────────────────────────────────────────────

/// An analysis plugin.
///
/// `run` returns a human-readable summary of what the pass did; the
/// framework stores it with the analysis record.
pub trait Analyzer: Send {
    /// Registry name, lower-case.
    fn name(&self) -> &'static str;

    /// Human-readable name.
    fn display_name(&self) -> &'static str;

    /// One-line description shown in plugin listings.
    fn description(&self) -> &'static str;

    /// Names of analyzers that must run before this one.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Execute the analysis.
    fn run(&mut self, ctx: &AnalyzerContext<'_>) -> TracelineResult<String>;
}
