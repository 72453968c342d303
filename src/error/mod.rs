//! Error types for Sibyl.

use thiserror::Error;

/// Primary error type for all Sibyl operations.
#[derive(Error, Debug)]
pub enum SibylError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Model not found: {id}")]
    ModelNotFound {
        id: String,
        available: Vec<String>,
        suggested: Vec<String>,
    },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Structured output error: {0}")]
    StructuredOutput(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by the retry policy and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Protocol,
    Validation,
    Authentication,
    RateLimit,
    Network,
    Timeout,
    Server,
    Api,
    Storage,
    Internal,
}

impl SibylError {
    /// Create an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Parse(_) | Self::InvalidRequest(_) | Self::MethodNotFound(_) => {
                ErrorCategory::Protocol
            }
            Self::InvalidParams(_) | Self::ModelNotFound { .. } => ErrorCategory::Validation,
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Network(_) => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Api { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                429 => ErrorCategory::RateLimit,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
            Self::Database(_) => ErrorCategory::Storage,
            _ => ErrorCategory::Internal,
        }
    }

    /// Whether this error is worth retrying at the same provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::RateLimit | ErrorCategory::Network | ErrorCategory::Server
        )
    }

    /// Whether a structured-output attempt should fall back to text mode
    /// (and flip the capability cache) on this error.
    pub fn is_format_failure(&self) -> bool {
        match self {
            Self::StructuredOutput(_) | Self::Timeout(_) => true,
            Self::Api { status, message } => {
                *status == 400 || message.contains("unsupported format")
            }
            _ => false,
        }
    }

    /// Numeric JSON-RPC error code for the wire.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::Parse(_) => -32700,
            Self::InvalidRequest(_) => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::Internal(_)
            | Self::Configuration(_)
            | Self::Database(_)
            | Self::Serialization(_)
            | Self::Io(_) => -32603,
            Self::ModelNotFound { .. } => -32001,
            Self::Authentication(_) => -32002,
            Self::RateLimited { .. } => -32003,
            Self::Api { .. }
            | Self::Network(_)
            | Self::Timeout(_)
            | Self::StructuredOutput(_) => -32000,
        }
    }

    /// Structured `data` attached to the wire error, when the kind carries any.
    pub fn rpc_data(&self) -> Option<serde_json::Value> {
        match self {
            Self::ModelNotFound {
                available,
                suggested,
                ..
            } => Some(serde_json::json!({
                "availableModels": available,
                "suggestedModels": suggested,
            })),
            Self::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(serde_json::json!({ "retryAfterMs": ms })),
            _ => None,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, SibylError>;
