use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    /// The remote already holds this key. Treated as success by the sync
    /// client - the desired state already holds.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Malformed identifier. Fatal and non-retryable; retrying cannot fix a
    /// bad id.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("rate limited - please wait before retrying")]
    RateLimited,

    #[error("request timed out")]
    Timeout,

    #[error("server error: {0}")]
    Server(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Retries ran to exhaustion; carries the last underlying failure.
    #[error("retries exhausted: {0}")]
    Exhausted(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RemoteError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..MAX_ERROR_BODY_LENGTH],
                body.len()
            )
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            400 | 422 => RemoteError::InvalidIdentifier(truncated),
            404 => RemoteError::NotFound(truncated),
            408 => RemoteError::Timeout,
            409 => RemoteError::DuplicateKey(truncated),
            429 => RemoteError::RateLimited,
            500..=599 => RemoteError::Server(truncated),
            _ => RemoteError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Duplicate-key collisions mean the desired state already holds.
    pub fn is_already_satisfied(&self) -> bool {
        matches!(self, RemoteError::DuplicateKey(_))
    }

    /// Fatal failures are surfaced immediately, without retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::InvalidIdentifier(_))
    }
}
