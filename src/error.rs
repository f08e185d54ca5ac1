//! Engine error taxonomy.
//!
//! Every entry point returns `Result<T, Error>`. Dependency clients own
//! their retries; by the time an error reaches a caller it is terminal for
//! the current request. Tenancy violations are reported as [`Error::NotFound`]
//! so that the existence of another tenant's resources is never revealed.

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt input: {0}")]
    CorruptInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota exceeded: {reason}")]
    QuotaExceeded {
        reason: String,
        /// Unix timestamp at which the relevant counter resets.
        reset_at: i64,
    },

    #[error("rate limited, retry after {retry_after:.1}s")]
    RateLimited { retry_after: f64 },

    #[error("embedding failure: {0}")]
    EmbeddingFailure(String),

    #[error("llm failure: {0}")]
    LlmFailure(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
