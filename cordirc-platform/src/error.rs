//! Upstream error type.

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("platform returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("event stream closed")]
    Closed,
}

pub type Result<T, E = PlatformError> = std::result::Result<T, E>;
