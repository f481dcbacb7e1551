//! API types and client configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClientError, ClientResult};

/// A document as returned by the service.
pub type Document = Value;

/// Length of an object id.
pub const OBJECT_ID_LEN: usize = 24;

/// Check the shape of an object id (24 hex characters).
pub fn is_object_id(id: &str) -> bool {
    id.len() == OBJECT_ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit())
}

pub(crate) fn check_object_id(id: &str) -> ClientResult<()> {
    if is_object_id(id) {
        Ok(())
    } else {
        Err(ClientError::InvalidId { id: id.to_string() })
    }
}

pub(crate) fn check_entity_type(entity_type: &str) -> ClientResult<()> {
    if entity_type.is_empty() {
        return Err(ClientError::invalid_argument("entity type must not be empty"));
    }
    Ok(())
}

/// Decoded response of one dispatched task.
///
/// A body of the form `{"metadata": .., "records": ..}` is unwrapped:
/// `body` holds the records and `metadata` the side-channel (pagination
/// totals and similar). Any other body is kept as is.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub body: Value,
    pub metadata: Option<Value>,
}

impl Reply {
    pub fn from_body(body: Value) -> Self {
        match body {
            Value::Object(mut map)
                if map.len() == 2 && map.contains_key("metadata") && map.contains_key("records") =>
            {
                let records = map.remove("records").unwrap_or(Value::Null);
                let metadata = map.remove("metadata");
                Self {
                    body: records,
                    metadata,
                }
            }
            body => Self {
                body,
                metadata: None,
            },
        }
    }

    /// Decode the body as a list of documents.
    pub fn into_documents(self) -> ClientResult<Paged<Vec<Document>>> {
        let records = match self.body {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(ClientError::InvalidResponse {
                    message: format!("expected a list of documents, got {}", kind_of(&other)),
                })
            }
        };
        Ok(Paged {
            records,
            metadata: self.metadata,
        })
    }
}

/// Result value with the optional out-of-band metadata the service attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Paged<T> {
    pub records: T,
    pub metadata: Option<Value>,
}

impl<T> Paged<T> {
    /// Total reported by the service, when present.
    pub fn total(&self) -> Option<u64> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("total"))
            .and_then(Value::as_u64)
    }
}

/// Extract the `_id` of a document.
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// How `get_by_ids` treats ids that failed individually.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialResults {
    /// Return the documents that were found; fail only when none were.
    #[default]
    Drop,
    /// Fail the whole call on the first failed id.
    Fail,
}

impl std::str::FromStr for PartialResults {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "fail" => Ok(Self::Fail),
            other => Err(ClientError::Config {
                message: format!("unknown partial results policy: {other}"),
            }),
        }
    }
}

/// Outcome of a multi-id fetch with per-id failures kept.
#[derive(Debug, Clone, Default)]
pub struct ByIdsOutcome {
    /// Found documents, in request order.
    pub documents: Vec<Document>,
    /// Failed ids with their error, in request order.
    pub failures: Vec<(String, ClientError)>,
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the document-store API.
    #[serde(default = "default_url")]
    pub url: String,

    /// API key.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Maximum requests in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Entries per entity type in the id-search and aggregate caches.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,

    /// Extra delay before a batch of single-id fetches is sent.
    #[serde(default)]
    pub batch_window_ms: u64,

    /// Policy for partially failed multi-id fetches.
    #[serde(default)]
    pub partial_results: PartialResults,
}

fn default_url() -> String {
    "https://api.docstore.dev/v1".to_string()
}

fn default_concurrency() -> usize {
    8
}

fn default_timeout() -> u64 {
    30
}

fn default_cache_capacity() -> u64 {
    1000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_key: None,
            concurrency: default_concurrency(),
            timeout_secs: default_timeout(),
            cache_capacity: default_cache_capacity(),
            batch_window_ms: 0,
            partial_results: PartialResults::default(),
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `DOCSTORE_URL` | API base URL |
    /// | `DOCSTORE_API_KEY` | API key |
    /// | `DOCSTORE_CONCURRENCY` | Maximum requests in flight |
    /// | `DOCSTORE_TIMEOUT` | Request timeout in seconds |
    /// | `DOCSTORE_CACHE_CAPACITY` | Search/aggregate cache entries per type |
    /// | `DOCSTORE_BATCH_WINDOW_MS` | Extra batching delay |
    /// | `DOCSTORE_PARTIAL_RESULTS` | `drop` or `fail` |
    pub fn from_env() -> Self {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        Self {
            url: std::env::var("DOCSTORE_URL").unwrap_or_else(|_| default_url()),
            api_key: std::env::var(crate::auth::API_KEY_ENV).ok(),
            concurrency: parsed("DOCSTORE_CONCURRENCY").unwrap_or_else(default_concurrency),
            timeout_secs: parsed("DOCSTORE_TIMEOUT").unwrap_or_else(default_timeout),
            cache_capacity: parsed("DOCSTORE_CACHE_CAPACITY")
                .unwrap_or_else(default_cache_capacity),
            batch_window_ms: parsed("DOCSTORE_BATCH_WINDOW_MS").unwrap_or(0),
            partial_results: parsed("DOCSTORE_PARTIAL_RESULTS").unwrap_or_default(),
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the number of concurrent requests.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the per-type search/aggregate cache capacity.
    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the extra batching delay.
    pub fn with_batch_window_ms(mut self, window_ms: u64) -> Self {
        self.batch_window_ms = window_ms;
        self
    }

    /// Set the partial-results policy.
    pub fn with_partial_results(mut self, policy: PartialResults) -> Self {
        self.partial_results = policy;
        self
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        if self.concurrency == 0 {
            return Err(ClientError::Config {
                message: "concurrency must be at least 1".into(),
            });
        }
        url::Url::parse(&self.url).map_err(|e| ClientError::Config {
            message: format!("invalid base URL {:?}: {}", self.url, e),
        })?;
        Ok(())
    }
}
