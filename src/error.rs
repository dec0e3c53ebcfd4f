use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("circuit open for `{service}`")]
    CircuitOpen { service: String },

    #[error("call to `{service}` timed out")]
    Timeout { service: String },

    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("adapter `{adapter}` not found")]
    AdapterNotFound { adapter: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Whether the queue should retry a job that failed with this error.
    /// Rate limits are handled separately (requeue with the advertised delay).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitOpen { .. }
            | Self::Timeout { .. }
            | Self::Transient(_)
            | Self::Http(_)
            | Self::Repository(_) => true,
            Self::RateLimited { .. } => true,
            Self::InvalidEnvelope(_)
            | Self::InvalidConfig(_)
            | Self::AdapterNotFound { .. }
            | Self::Serialization(_)
            | Self::Fatal(_) => false,
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Repository(err.to_string())
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Transient(format!("redis: {err}"))
    }
}
