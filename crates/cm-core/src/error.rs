use thiserror::Error;

/// Error type user functions may return. Anything implementing
/// `std::error::Error + Send + Sync` converts into it with `?` or `.into()`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a single job ended as `Failed`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Requested function not found: requested={requested}, known=[{}]", .known.join(", "))]
    FunctionNotFound {
        requested: String,
        known: Vec<String>,
    },

    #[error("failed to deserialize input as {type_name}")]
    Deserialization {
        type_name: &'static str,
        #[source]
        source: CodecError,
    },

    #[error("function execution failed")]
    Execution(#[source] BoxError),

    #[error("function panicked: {0}")]
    Panicked(String),

    #[error("function produced an empty payload")]
    EmptyOutput,

    #[error("failed to serialize output of type {type_name}")]
    Serialization {
        type_name: &'static str,
        #[source]
        source: CodecError,
    },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Custom(String),
}

/// Failures inside a job source. The engine logs these and keeps polling.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("unknown job id: {0}")]
    UnknownJob(String),

    #[error("job source closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("function already registered: {0}")]
    DuplicateFunction(String),
}
