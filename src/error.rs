//! Error types for the UA bouncer

use thiserror::Error;

/// Result type alias for bouncer operations
pub type Result<T> = std::result::Result<T, BouncerError>;

/// Error types that can occur while building or serving the pipeline
#[derive(Error, Debug, Clone)]
pub enum BouncerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Setup of handler '{handler}' failed: {message}")]
    SetupFailure { handler: String, message: String },

    #[error("Handler '{handler}' failed: {message}")]
    HandlerFailure { handler: String, message: String },

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Cache protocol error: {0}")]
    ProtocolError(String),

    #[error("Classification error: {0}")]
    ClassificationError(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for BouncerError {
    fn from(err: std::io::Error) -> Self {
        BouncerError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for BouncerError {
    fn from(err: serde_json::Error) -> Self {
        BouncerError::CodecError(err.to_string())
    }
}

impl BouncerError {
    /// Whether this error comes from the cache layer
    ///
    /// Cache errors at request time are recovered locally: a failed lookup
    /// counts as a miss and a failed store only costs a recomputation later.
    pub fn is_cache_error(&self) -> bool {
        matches!(
            self,
            BouncerError::CacheError(_)
                | BouncerError::ProtocolError(_)
                | BouncerError::CodecError(_)
                | BouncerError::IoError(_)
        )
    }

    /// Convert error to HTTP status code
    ///
    /// Handler and internal failures surface as a generic 500, a rejected
    /// admin token as 401 and a malformed admin request as 400.
    pub fn to_http_status(&self) -> u16 {
        match self {
            BouncerError::Unauthorized(_) => 401,
            BouncerError::HttpError(_) => 400,
            BouncerError::ConfigError(_) => 500,
            BouncerError::SetupFailure { .. } => 500,
            BouncerError::HandlerFailure { .. } => 500,
            BouncerError::CacheError(_) => 500,
            BouncerError::ProtocolError(_) => 500,
            BouncerError::ClassificationError(_) => 500,
            BouncerError::CodecError(_) => 500,
            BouncerError::IoError(_) => 500,
            BouncerError::InternalError(_) => 500,
        }
    }

    /// Wrap any error raised by a handler with that handler's identity
    pub fn handler_failure(handler: impl Into<String>, err: impl std::fmt::Display) -> Self {
        BouncerError::HandlerFailure {
            handler: handler.into(),
            message: err.to_string(),
        }
    }

    /// Wrap any error raised during setup with the handler's identity
    pub fn setup_failure(handler: impl Into<String>, err: impl std::fmt::Display) -> Self {
        BouncerError::SetupFailure {
            handler: handler.into(),
            message: err.to_string(),
        }
    }
}
