//! Tracing conventions for traceline.
//!
//! All spans and events emitted by the workspace use the [`TARGET_PREFIX`]
//! target, so consumers can filter them in one directive:
//!
//! ```text
//! RUST_LOG=traceline=debug
//! ```
//!
//! Consumers bring their own subscriber; the CLI installs one, library
//! crates never do.

use tracing::Level;

/// Target prefix used by all traceline tracing spans and events.
pub const TARGET_PREFIX: &str = "traceline";

/// Standard tracing span names used across the pipeline.
///
/// Consistent span naming lets subscribers, dashboards, and tests match on
/// pipeline stages by name.
pub mod span_names {
    /// Root span for one search request.
    pub const SEARCH: &str = "traceline::search";
    /// One scroll continuation.
    pub const SCROLL: &str = "traceline::scroll";
    /// Bulk buffer flush.
    pub const FLUSH: &str = "traceline::flush";
    /// One aggregator run.
    pub const AGGREGATE: &str = "traceline::aggregate";
    /// One analyzer run.
    pub const ANALYZE: &str = "traceline::analyze";
    /// Full export of a query to CSV.
    pub const EXPORT: &str = "traceline::export";
    /// Scripted label update.
    pub const LABEL_UPDATE: &str = "traceline::label_update";
}

/// Standard structured field names used in tracing events.
pub mod field_names {
    pub const SKETCH_ID: &str = "sketch_id";
    pub const INDEX: &str = "index";
    pub const QUERY_LEN: &str = "query_len";
    pub const HIT_COUNT: &str = "hit_count";
    pub const TOTAL_HITS: &str = "total_hits";
    pub const ACTION_COUNT: &str = "action_count";
    pub const DROPPED_COUNT: &str = "dropped_count";
    pub const ANALYZER: &str = "analyzer";
    pub const AGGREGATOR: &str = "aggregator";
    pub const SESSION_COUNT: &str = "session_count";
    pub const ROW_COUNT: &str = "row_count";
    pub const DURATION_US: &str = "duration_us";
}

/// Parse a log level string (case-insensitive).
///
/// Recognized values: `trace`, `debug`, `info`, `warn`, `error`.
/// Returns `None` for unrecognized strings.
#[must_use]
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Returns the recommended `tracing::Level` for the given environment.
///
/// Checks `TRACELINE_LOG_LEVEL` first, then falls back to the provided
/// default.
#[must_use]
pub fn level_from_env(default: Level) -> Level {
    std::env::var("TRACELINE_LOG_LEVEL")
        .ok()
        .and_then(|s| parse_level(&s))
        .unwrap_or(default)
}
