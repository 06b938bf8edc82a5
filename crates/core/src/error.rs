use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),

    #[error("all {attempts} acquisition attempts failed after pool rebuild: {last_error}")]
    AllAttemptsFailed { attempts: u32, last_error: String },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("liveness probe failed: {0}")]
    Probe(String),

    #[error("connection pool is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("{backend} connection error: {details}")]
    Connection { backend: String, details: String },

    #[error("retrieval timed out after {0:?}")]
    Timeout(Duration),

    #[error("scoring failed: {0}")]
    Scoring(String),

    #[error("{backend} query failed: {details}")]
    Query { backend: String, details: String },

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("retrieval request failed: {0}")]
    Request(String),
}

impl RetrievalError {
    pub fn connection(backend: impl Into<String>, details: impl ToString) -> Self {
        Self::Connection {
            backend: backend.into(),
            details: details.to_string(),
        }
    }

    /// Errors worth retrying on a fresh connection.
    pub fn is_connection_class(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Http(error) => error.is_connect() || error.is_timeout(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("computation failed: {0}")]
    Computation(String),

    #[error("computation panicked: {0}")]
    Panicked(String),

    #[error("computation queue is shut down")]
    QueueClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = RetrievalError> = std::result::Result<T, E>;
