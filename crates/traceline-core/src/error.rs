//! Error taxonomy for traceline.
//!
//! Every fallible operation in the workspace returns [`TracelineResult`].
//! Variants are grouped by how callers should react: [`is_retryable`]
//! distinguishes transient backend conditions from permanent failures so
//! schedulers can retry without inspecting message text.
//!
//! [`is_retryable`]: TracelineError::is_retryable

/// All errors produced by traceline components.
#[derive(Debug, thiserror::Error)]
pub enum TracelineError {
    /// The query string, DSL document, or a filter chip was malformed.
    /// Not retryable; the caller must fix the query.
    #[error("bad query: {detail}")]
    BadQuery {
        /// What was wrong with the query.
        detail: String,
    },

    /// The backend failed in a way that is expected to clear: connection
    /// refused, request timeout, HTTP 5xx, or an expired scroll context.
    #[error("backend transient failure during {operation}: {detail}. Retry with backoff.")]
    BackendTransient {
        /// Operation that was in flight (`"search"`, `"scroll"`, ...).
        operation: &'static str,
        /// Backend-reported detail.
        detail: String,
    },

    /// An index or document the caller named does not exist.
    #[error("{kind} not found: {id}")]
    BackendNotFound {
        /// What was missing (`"index"`, `"document"`).
        kind: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },

    /// A bulk flush partially failed. Successful items stand; `dropped`
    /// actions were rejected and are summarized by error class.
    #[error("{dropped} events failed: {summary}")]
    BackendItemError {
        /// Error-class summary, one entry per distinct failure signature.
        summary: String,
        /// Number of actions that were rejected.
        dropped: usize,
    },

    /// An analyzer was misconfigured. Raised before any backend call.
    #[error("analyzer {analyzer} rejected its configuration: {detail}")]
    AnalyzerValidation {
        /// Analyzer registry name.
        analyzer: String,
        /// Validation failure detail.
        detail: String,
    },

    /// Cooperative cancellation was observed between work units.
    #[error("operation cancelled: {operation}")]
    Cancelled {
        /// Operation that observed the cancellation.
        operation: String,
    },

    /// A plugin name was registered twice in the same registry.
    #[error("duplicate {kind} registration: {name}")]
    DuplicateRegistration {
        /// Registry kind (`"aggregator"`, `"analyzer"`, `"chain plugin"`).
        kind: &'static str,
        /// Offending registry key.
        name: String,
    },

    /// A plugin name was requested that no registry entry matches.
    #[error("unknown {kind}: {name}")]
    UnknownPlugin {
        /// Registry kind (`"aggregator"`, `"analyzer"`, `"chain plugin"`).
        kind: &'static str,
        /// Requested registry key.
        name: String,
    },

    /// I/O error from the local filesystem (export targets, config files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV writing failure during export.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl TracelineError {
    /// Whether retrying the operation (with backoff) can succeed without
    /// the caller changing anything.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendTransient { .. })
    }

    /// Shorthand for a [`TracelineError::BadQuery`] with an owned detail.
    #[must_use]
    pub fn bad_query(detail: impl Into<String>) -> Self {
        Self::BadQuery {
            detail: detail.into(),
        }
    }

    /// Shorthand for a transient backend failure.
    #[must_use]
    pub fn transient(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::BackendTransient {
            operation,
            detail: detail.into(),
        }
    }
}

/// Result alias used across all traceline crates.
pub type TracelineResult<T> = Result<T, TracelineError>;
