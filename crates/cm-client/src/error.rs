use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("required environment variable not found: {0}")]
    MissingEnv(&'static str),

    #[error("failed to read module auth token from {path}: {source}")]
    TokenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read CA certificate from {path}: {reason}")]
    CaCertificate { path: PathBuf, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("failed to build HTTP client: {0}")]
    Http(String),

    #[error("auth error: {0}")]
    Auth(#[from] cm_auth::AuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
