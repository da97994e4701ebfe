use std::error::Error;
use std::fmt::Write;

use crate::error::JobError;

/// Terminal outcome of one job. Exactly one is produced and posted per job.
#[derive(Debug)]
pub enum JobResult {
    Ok { job_id: String, payload: Vec<u8> },
    Failed { job_id: String, error: JobError },
}

impl JobResult {
    pub fn ok(job_id: impl Into<String>, payload: Vec<u8>) -> Self {
        JobResult::Ok {
            job_id: job_id.into(),
            payload,
        }
    }

    pub fn failed(job_id: impl Into<String>, error: JobError) -> Self {
        JobResult::Failed {
            job_id: job_id.into(),
            error,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobResult::Ok { job_id, .. } | JobResult::Failed { job_id, .. } => job_id,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, JobResult::Ok { .. })
    }

    /// Turn an `Ok` with no bytes into [`JobError::EmptyOutput`], so a job
    /// source is never handed an empty payload.
    pub fn reject_empty(self) -> Self {
        match self {
            JobResult::Ok { job_id, payload } if payload.is_empty() => {
                JobResult::failed(job_id, JobError::EmptyOutput)
            }
            other => other,
        }
    }

    /// Render to the bytes posted back to the job source. Successes pass their
    /// payload through; failures become a diagnostic trace.
    pub fn into_payload(self) -> Vec<u8> {
        match self {
            JobResult::Ok { payload, .. } => payload,
            JobResult::Failed { job_id, error } => render_diagnostic(&job_id, &error),
        }
    }
}

/// Render a failure as `JobId: <id>` followed by the error and its full source
/// chain, one cause per line.
///
/// Never returns an empty payload: if a `Display` impl in the chain fails, a
/// short fallback message naming the job is returned instead.
pub fn render_diagnostic(job_id: &str, error: &(dyn Error + 'static)) -> Vec<u8> {
    match write_trace(job_id, error) {
        Ok(text) => text.into_bytes(),
        Err(_) => {
            tracing::error!(job_id, "Failed to render job diagnostic");
            format!("Exception serializing exception for job, check logs: {job_id}").into_bytes()
        }
    }
}

fn write_trace(job_id: &str, error: &(dyn Error + 'static)) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    writeln!(out, "JobId: {job_id}")?;
    writeln!(out, "Error: {error}")?;
    let mut source = error.source();
    while let Some(cause) = source {
        writeln!(out, "Caused by: {cause}")?;
        source = cause.source();
    }
    Ok(out)
}
