//! Error types for the document-store client.

use std::collections::BTreeMap;

/// Client errors.
///
/// Errors are `Clone` because one failed network call settles every caller
/// that was coalesced onto it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Object id does not have the 24-character hex shape.
    #[error("invalid object id: {id:?}")]
    InvalidId { id: String },

    /// No API key configured at the time the task was dequeued.
    #[error("no API key configured")]
    MissingCredential,

    /// A required argument was empty or malformed.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Object missing from a multi-get result.
    #[error("{id} is not found")]
    NotFound { entity_type: String, id: String },

    /// Non-success status from the remote service.
    #[error("remote error {code} (HTTP {status}): {message}")]
    Remote {
        status: u16,
        code: i64,
        message: String,
        /// Field-level validation messages (field -> message).
        fields: BTreeMap<String, String>,
    },

    /// Transport failure (connection, TLS, timeout).
    #[error("network error: {message}")]
    Network { message: String },

    /// Response body could not be decoded.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The producer side was dropped before settling.
    #[error("request abandoned before completion")]
    Abandoned,
}

impl ClientError {
    /// Numeric code of the error.
    ///
    /// Remote errors carry the service's own code; the rest use the HTTP
    /// status they most resemble, and `0` for transport failures.
    pub fn code(&self) -> i64 {
        match self {
            Self::Remote { code, .. } => *code,
            Self::InvalidId { .. } | Self::InvalidArgument { .. } => 400,
            Self::MissingCredential => 401,
            Self::NotFound { .. } => 404,
            Self::Network { .. } | Self::InvalidResponse { .. } => 0,
            Self::Config { .. } | Self::Abandoned => 0,
        }
    }

    /// Field-level error map, present only for remote validation errors.
    pub fn fields(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Remote { fields, .. } if !fields.is_empty() => Some(fields),
            _ => None,
        }
    }

    /// Whether the error was raised before any network attempt.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InvalidId { .. } | Self::MissingCredential | Self::InvalidArgument { .. }
        )
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
