//! HTTP transport seam for the index adapter.
//!
//! [`Transport`] is the lowest-level boundary: one request in, one status
//! plus JSON body out. The production implementation wraps a blocking
//! `reqwest` client; tests substitute canned responses. Status-code
//! interpretation happens a layer up in the store, where the operation
//! context is known.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use traceline_core::{TracelineError, TracelineResult};

/// HTTP method for a backend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// Request body: JSON for regular APIs, newline-delimited JSON for `_bulk`.
#[derive(Debug, Clone)]
pub enum Body {
    Json(Value),
    NdJson(String),
}

/// One request against the backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    /// Path relative to the server root, without a leading slash.
    pub path: String,
    /// Query-string parameters.
    pub params: Vec<(String, String)>,
    pub body: Option<Body>,
}

impl BackendRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    #[must_use]
    pub fn ndjson(mut self, body: String) -> Self {
        self.body = Some(Body::NdJson(body));
        self
    }
}

/// Status and parsed body of a backend response.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub body: Value,
}

impl BackendResponse {
    /// 2xx check.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport boundary between the store and the wire.
pub trait Transport: Send + Sync {
    /// Execute one request. Transport-level failures (connect, timeout)
    /// surface as [`TracelineError::BackendTransient`]; HTTP error statuses
    /// are returned as responses for the store to interpret.
    fn execute(&self, request: &BackendRequest) -> TracelineResult<BackendResponse>;
}

/// Connection settings for the HTTP transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Backend hostname or IP.
    #[serde(default = "default_host")]
    pub host: String,
    /// Backend port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use HTTPS.
    #[serde(default)]
    pub ssl: bool,
    /// Basic-auth username.
    #[serde(default)]
    pub user: Option<String>,
    /// Basic-auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    9200
}

fn default_timeout() -> u64 {
    10
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ssl: false,
            user: None,
            password: None,
            timeout_secs: default_timeout(),
        }
    }
}

impl TransportConfig {
    /// Base URL for the configured server.
    #[must_use]
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Blocking `reqwest` transport.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    config: TransportConfig,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.config.base_url())
            .finish()
    }
}

impl HttpTransport {
    /// Build a transport from connection settings.
    pub fn new(config: TransportConfig) -> TracelineResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TracelineError::transient("connect", e.to_string()))?;
        Ok(Self { client, config })
    }

    fn map_error(operation: &'static str, error: &reqwest::Error) -> TracelineError {
        // Connect and timeout failures are worth retrying; anything else
        // from the client layer is reported the same way since the caller
        // cannot fix it by changing the query.
        TracelineError::transient(operation, error.to_string())
    }
}

impl Transport for HttpTransport {
    fn execute(&self, request: &BackendRequest) -> TracelineResult<BackendResponse> {
        let url = format!("{}/{}", self.config.base_url(), request.path);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        debug!(
            target: "traceline",
            method = request.method.as_str(),
            path = %request.path,
            "backend request"
        );

        let mut builder = self.client.request(method, &url).query(&request.params);
        if let (Some(user), Some(password)) = (&self.config.user, &self.config.password) {
            builder = builder.basic_auth(user, Some(password));
        }
        builder = match &request.body {
            Some(Body::Json(value)) => builder.json(value),
            Some(Body::NdJson(text)) => builder
                .header("content-type", "application/x-ndjson")
                .body(text.clone()),
            None => builder,
        };

        let response = builder
            .send()
            .map_err(|e| Self::map_error("request", &e))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .map_err(|e| Self::map_error("response", &e))?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(BackendResponse { status, body })
    }
}
