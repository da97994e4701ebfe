use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use crate::error::{CodecError, SourceError};
use crate::job::Job;

/// Supplies jobs to the engine and accepts their results.
///
/// `get_job` is the engine's only suspension point: it may block, sleep, or
/// retry internally for as long as it likes. `Ok(None)` means "nothing this
/// time" and is not an error.
pub trait JobSource: Send + Sync {
    fn get_job(&self) -> BoxFuture<'_, Result<Option<Job>, SourceError>>;

    fn post_result<'a>(
        &'a self,
        job_id: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), SourceError>>;
}

impl<T: JobSource + ?Sized> JobSource for Arc<T> {
    fn get_job(&self) -> BoxFuture<'_, Result<Option<Job>, SourceError>> {
        (**self).get_job()
    }

    fn post_result<'a>(
        &'a self,
        job_id: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), SourceError>> {
        (**self).post_result(job_id, payload)
    }
}

/// In-process job source for tests and embedders that produce jobs locally.
///
/// Use [`submit`](Self::submit) / [`result`](Self::result) (or
/// [`execute`](Self::execute)) from the caller side; the engine drives
/// `get_job` / `post_result`. Each submitted job id accepts exactly one posted
/// result.
pub struct InMemoryJobSource {
    jobs_tx: mpsc::UnboundedSender<Job>,
    jobs_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,
    senders: Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>,
    receivers: Mutex<HashMap<String, oneshot::Receiver<Vec<u8>>>>,
    posts: AtomicUsize,
}

impl Default for InMemoryJobSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobSource {
    pub fn new() -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        Self {
            jobs_tx,
            jobs_rx: tokio::sync::Mutex::new(jobs_rx),
            senders: Mutex::new(HashMap::new()),
            receivers: Mutex::new(HashMap::new()),
            posts: AtomicUsize::new(0),
        }
    }

    /// Queue a job under a fresh id and return that id.
    pub fn submit<I: Serialize>(
        &self,
        query_type: impl Into<String>,
        input: I,
    ) -> Result<String, SourceError> {
        let query = serde_json::to_value(input).map_err(CodecError::from)?;
        let job_id = uuid::Uuid::new_v4().to_string();
        self.submit_job(Job::new(job_id.clone(), query_type, query))?;
        Ok(job_id)
    }

    /// Queue a fully formed job, keeping its id.
    pub fn submit_job(&self, job: Job) -> Result<(), SourceError> {
        let (tx, rx) = oneshot::channel();
        lock(&self.senders).insert(job.job_id.clone(), tx);
        lock(&self.receivers).insert(job.job_id.clone(), rx);
        tracing::debug!(job_id = %job.job_id, query_type = %job.query_type, "Job submitted");
        self.jobs_tx.send(job).map_err(|_| SourceError::Closed)
    }

    /// Wait for the payload posted for `job_id`. Each result can be taken once.
    pub async fn result(&self, job_id: &str) -> Result<Vec<u8>, SourceError> {
        let rx = lock(&self.receivers)
            .remove(job_id)
            .ok_or_else(|| SourceError::UnknownJob(job_id.to_string()))?;
        rx.await.map_err(|_| SourceError::Closed)
    }

    /// Wait for the result and decode it as JSON.
    pub async fn result_as<O: DeserializeOwned>(&self, job_id: &str) -> Result<O, SourceError> {
        let payload = self.result(job_id).await?;
        Ok(serde_json::from_slice(&payload).map_err(CodecError::from)?)
    }

    pub async fn execute<I: Serialize>(
        &self,
        query_type: &str,
        input: I,
    ) -> Result<Vec<u8>, SourceError> {
        let job_id = self.submit(query_type, input)?;
        self.result(&job_id).await
    }

    pub async fn execute_as<I: Serialize, O: DeserializeOwned>(
        &self,
        query_type: &str,
        input: I,
    ) -> Result<O, SourceError> {
        let job_id = self.submit(query_type, input)?;
        self.result_as(&job_id).await
    }

    /// Total `post_result` calls seen, including rejected ones.
    pub fn post_count(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }
}

impl JobSource for InMemoryJobSource {
    fn get_job(&self) -> BoxFuture<'_, Result<Option<Job>, SourceError>> {
        Box::pin(async move {
            let mut rx = self.jobs_rx.lock().await;
            Ok(rx.recv().await)
        })
    }

    fn post_result<'a>(
        &'a self,
        job_id: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), SourceError>> {
        Box::pin(async move {
            self.posts.fetch_add(1, Ordering::SeqCst);
            let tx = lock(&self.senders)
                .remove(job_id)
                .ok_or_else(|| SourceError::UnknownJob(job_id.to_string()))?;
            // A dropped receiver only means nobody is waiting; the post still counts.
            let _ = tx.send(payload);
            Ok(())
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
