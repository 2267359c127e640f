use std::sync::Arc;

/// Represents a result type for operations in the SDK.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// SDK-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the SDK.
///
/// None of these errors ever reach a caller of the `*_variation` functions: evaluation misses are
/// turned into the caller-supplied default. They surface from lifecycle calls
/// ([`Client::new`](crate::Client::new),
/// [`Client::wait_for_initialization`](crate::Client::wait_for_initialization)) and from the
/// pluggable store/transport traits.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// API key is missing or empty.
    #[error("api_key is missing or empty")]
    MissingApiKey,

    /// Authentication response did not carry usable claims.
    #[error("invalid authentication token: {0}")]
    InvalidToken(String),

    /// The requested resource does not exist on the server.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Error serializing or deserializing a flag or segment record.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),

    /// Error reported by a durable store implementation.
    #[error("durable store error: {0}")]
    Store(String),

    /// The SDK has to be started from within a Tokio runtime.
    #[error("no tokio runtime available, the client must be created inside a runtime")]
    NoRuntime,

    /// The client has been closed.
    #[error("client is closed")]
    Closed,
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::Unauthorized
                | Error::MissingApiKey
                | Error::InvalidBaseUrl(_)
                | Error::NotFound(_)
                | Error::NoRuntime
                | Error::Closed
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(value))
    }
}
