//! Pull-based event streaming over search plus scroll.
//!
//! [`HitStream`] hides the scroll bookkeeping behind a plain iterator:
//! consumers pull one hit at a time and the stream fetches the next scroll
//! page when its buffer runs dry. Backpressure is inherent; nothing is
//! fetched until the consumer asks for it.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::debug;

use crate::error::TracelineResult;
use crate::traits::EventBackend;
use crate::types::SearchRequest;

/// Default page size and per-shard termination limit when streaming.
pub const DEFAULT_STREAM_LIMIT: u64 = 5000;

/// Keep-alive for scroll continuations while streaming.
const SCROLL_KEEP_ALIVE: &str = "5m";

/// Iterator over every hit of a search, page by page.
pub struct HitStream<'a> {
    backend: &'a dyn EventBackend,
    buffer: VecDeque<Value>,
    scroll_id: Option<String>,
    total: u64,
    exhausted: bool,
    failed: bool,
}

impl<'a> HitStream<'a> {
    /// Run the initial search and prepare to stream its full result set.
    ///
    /// Streaming defaults `size` and `terminate_after` to
    /// [`DEFAULT_STREAM_LIMIT`] and enables scrolling unless the caller
    /// already decided otherwise.
    pub fn open(backend: &'a dyn EventBackend, mut request: SearchRequest) -> TracelineResult<Self> {
        if request.filter.size.is_none() {
            request.filter.size = Some(DEFAULT_STREAM_LIMIT);
        }
        if request.filter.terminate_after.is_none() {
            request.filter.terminate_after = Some(DEFAULT_STREAM_LIMIT);
        }
        let scrolling = request.enable_scroll;

        let response = backend.search(&request)?;
        let total = response.hits.total;
        debug!(
            target: "traceline",
            total_hits = total,
            page_len = response.hits.hits.len(),
            scrolling,
            "hit stream opened"
        );

        Ok(Self {
            backend,
            buffer: response.hits.hits.into(),
            scroll_id: if scrolling { response.scroll_id } else { None },
            total,
            exhausted: !scrolling,
            failed: false,
        })
    }

    /// Total hits reported by the initial search.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    fn fetch_next_page(&mut self) -> TracelineResult<()> {
        let Some(scroll_id) = self.scroll_id.clone() else {
            self.exhausted = true;
            return Ok(());
        };
        let response = self.backend.scroll(&scroll_id, SCROLL_KEEP_ALIVE)?;
        if response.hits.hits.is_empty() {
            self.exhausted = true;
            return Ok(());
        }
        if response.scroll_id.is_some() {
            self.scroll_id = response.scroll_id;
        }
        self.buffer.extend(response.hits.hits);
        Ok(())
    }
}

impl Iterator for HitStream<'_> {
    type Item = TracelineResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(hit) = self.buffer.pop_front() {
                return Some(Ok(hit));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_next_page() {
                self.failed = true;
                return Some(Err(e));
            }
        }
    }
}
