use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A unit of work handed out by a job source.
///
/// Wire shape: `{"jobId": "...", "queryType": "...", "query": <any>}`.
/// Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub query_type: String,
    #[serde(default)]
    pub query: serde_json::Value,
}

impl Job {
    pub fn new(
        job_id: impl Into<String>,
        query_type: impl Into<String>,
        query: serde_json::Value,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            query_type: query_type.into(),
            query,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Per-invocation handle passed to a function.
///
/// Cheap to clone. New fields may be added without breaking function
/// signatures, so it is only built through constructors.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Context {
    job_id: Arc<str>,
    shutdown: CancellationToken,
}

impl Context {
    /// Standalone context, for calling a function outside the engine.
    pub fn new(job_id: &str) -> Self {
        Self::with_shutdown(job_id, CancellationToken::new())
    }

    pub(crate) fn with_shutdown(job_id: &str, shutdown: CancellationToken) -> Self {
        Self {
            job_id: Arc::from(job_id),
            shutdown,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Cancelled once the engine starts shutting down. The engine never aborts a
    /// running function; long-running functions may poll this to stop early.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
