use thiserror::Error;

/// Error taxonomy shared across the proxy. `.code()` is the literal string
/// surfaced to clients as `error.type` in the error envelope (spec §7).
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown domain: {domain}")]
    UnknownDomain { domain: String },

    #[error("credential expired for domain {domain}")]
    ExpiredToken { domain: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("client disconnected")]
    ClientDisconnect,

    #[error("storage degraded: {0}")]
    StorageDegraded(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Stable error code sent to clients as `error.type`.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "config_error",
            ProxyError::Validation(_) => "invalid_request_error",
            ProxyError::UnknownDomain { .. } => "authentication_error",
            ProxyError::ExpiredToken { .. } => "authentication_error",
            ProxyError::RateLimited { .. } => "rate_limit_error",
            ProxyError::Upstream { .. } => "upstream_error",
            ProxyError::Timeout { .. } => "timeout_error",
            ProxyError::Network(_) => "network_error",
            ProxyError::ClientDisconnect => "client_disconnect",
            ProxyError::StorageDegraded(_) => "storage_degraded",
            ProxyError::Database(_) => "database_error",
            ProxyError::Serialization(_) => "serialization_error",
            ProxyError::Io(_) => "io_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status this error maps to on the proxy's response (spec §7).
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Validation(_) => 400,
            ProxyError::UnknownDomain { .. } => 401,
            ProxyError::ExpiredToken { .. } => 401,
            ProxyError::RateLimited { .. } => 429,
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::Timeout { .. } => 504,
            ProxyError::Network(_) => 502,
            ProxyError::ClientDisconnect => 499,
            ProxyError::StorageDegraded(_) => 200,
            ProxyError::Config(_)
            | ProxyError::Database(_)
            | ProxyError::Serialization(_)
            | ProxyError::Io(_)
            | ProxyError::Internal(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
