use thiserror::Error;

/// Error taxonomy propagated out of every provider adapter.
///
/// The worker's retry classification keys off these messages, so the
/// variants keep their conventional wording ("authentication",
/// "rate limit", "connection", "invalid request").
#[derive(Debug, Error)]
pub enum AIClientError {
    #[error("authentication failed for {provider}: {message}")]
    Authentication { provider: String, message: String },

    #[error("rate limit exceeded for {provider}: {message}")]
    RateLimit { provider: String, message: String },

    #[error("connection error for {provider}: {message}")]
    Connection { provider: String, message: String },

    #[error("invalid request to {provider}: {message}")]
    InvalidRequest { provider: String, message: String },

    #[error("ai client error for {provider}: {message}")]
    Other { provider: String, message: String },
}

impl AIClientError {
    /// Map an HTTP status to the right variant.
    pub fn from_status(provider: &str, status: u16, body: String) -> Self {
        match status {
            401 | 403 => AIClientError::Authentication {
                provider: provider.to_string(),
                message: format!("HTTP {status}: {body}"),
            },
            429 => AIClientError::RateLimit {
                provider: provider.to_string(),
                message: format!("HTTP {status}: {body}"),
            },
            400 | 404 | 422 => AIClientError::InvalidRequest {
                provider: provider.to_string(),
                message: format!("HTTP {status}: {body}"),
            },
            _ => AIClientError::Other {
                provider: provider.to_string(),
                message: format!("HTTP {status}: {body}"),
            },
        }
    }
}
