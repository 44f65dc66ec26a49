use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraylogMcpError>;

/// Upstream response bodies are cut to this many bytes when rendered.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Error)]
pub enum GraylogMcpError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Graylog API error: status={status} path={path} body={}", truncate_body(.body))]
    Api {
        status: u16,
        path: String,
        body: String,
    },

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream request timed out")]
    Timeout,

    #[error("pattern mining failed: {0}")]
    Mining(String),

    #[error("failed to marshal response: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GraylogMcpError {
    /// True for errors raised before any upstream call was made.
    pub fn is_validation(&self) -> bool {
        matches!(self, GraylogMcpError::InvalidRequest(_))
    }
}

impl From<reqwest::Error> for GraylogMcpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GraylogMcpError::Timeout
        } else {
            GraylogMcpError::Upstream(e.to_string())
        }
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    format!("{}...[truncated]", crate::fit::truncate_str(body, MAX_ERROR_BODY))
}
