use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0} must be set")]
    MissingField(&'static str),

    #[error("invalid hostname {host}: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("token request failed: {0}")]
    Http(String),

    #[error("token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse token response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no token has been obtained from {0}")]
    NoToken(String),
}
