use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{EngineError, JobError};
use crate::executor::{TaskExecutor, TokioExecutor};
use crate::job::{Context, Job};
use crate::metrics::EngineMetrics;
use crate::registry::{Registry, RegistryBuilder};
use crate::result::JobResult;
use crate::runner::{Function, FunctionRunner, Runner, panic_message};
use crate::source::JobSource;

/// The compute module engine -- polls a job source and fans jobs out to
/// registered functions.
///
/// Polling is a single sequential loop. Every job is handed to the
/// [`TaskExecutor`] and the loop goes straight back to polling, so a slow or
/// failing function never holds up other jobs. Each job produces exactly one
/// [`JobResult`] and exactly one `post_result` call.
pub struct Engine {
    source: Arc<dyn JobSource>,
    registry: Registry,
    executor: Arc<dyn TaskExecutor>,
    metrics: Arc<EngineMetrics>,
}

pub struct EngineBuilder {
    source: Arc<dyn JobSource>,
    registry: RegistryBuilder,
    executor: Arc<dyn TaskExecutor>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl EngineBuilder {
    /// Register a function using the JSON codec for input and output.
    pub fn add<I, O>(self, name: impl Into<String>, function: impl Function<I, O>) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
    {
        self.add_runner(name, FunctionRunner::new(function))
    }

    /// Register a function whose returned bytes are posted without encoding.
    pub fn add_raw<I>(self, name: impl Into<String>, function: impl Function<I, Vec<u8>>) -> Self
    where
        I: DeserializeOwned + Send + 'static,
    {
        self.add_runner(name, FunctionRunner::raw(function))
    }

    /// Register a prebuilt runner, e.g. one with custom codecs.
    pub fn add_runner(mut self, name: impl Into<String>, runner: impl Runner + 'static) -> Self {
        self.registry = self.registry.register(name, runner);
        self
    }

    /// Replace the default one-task-per-job executor.
    pub fn with_executor(mut self, executor: impl TaskExecutor + 'static) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        Ok(Engine {
            source: self.source,
            registry: self.registry.build()?,
            executor: self.executor,
            metrics: self.metrics.unwrap_or_default(),
        })
    }
}

impl Engine {
    pub fn builder(source: impl JobSource + 'static) -> EngineBuilder {
        EngineBuilder {
            source: Arc::new(source),
            registry: Registry::builder(),
            executor: Arc::new(TokioExecutor::new()),
            metrics: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Poll forever. Equivalent to [`run`](Self::run) with a token nobody cancels.
    pub async fn start(self) {
        self.run(CancellationToken::new()).await
    }

    /// Poll until `shutdown` is cancelled, then wait for in-flight jobs to post
    /// their results before returning.
    ///
    /// Errors and panics from the job source are logged and polling continues.
    pub async fn run(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        tracing::info!(functions = ?self.registry.names(), "Engine started");

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                // Building the future inside the guard also catches sources that
                // panic before returning one.
                polled = AssertUnwindSafe(async { self.source.get_job().await })
                    .catch_unwind() => polled,
            };

            match polled {
                Ok(Ok(Some(job))) => {
                    self.dispatch(job, &tracker, &shutdown);
                    continue;
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    self.metrics.record_poll_error();
                    tracing::error!(error = %e, "Failed to poll for job");
                }
                Err(panic) => {
                    self.metrics.record_poll_error();
                    tracing::error!(
                        panic = %panic_message(&*panic),
                        "Job source panicked while polling"
                    );
                }
            }

            // Not a backoff: lets other tasks run if the source returns immediately.
            tokio::task::yield_now().await;
        }

        tracker.close();
        tracing::info!(in_flight = tracker.len(), "Shutdown requested, draining in-flight jobs");
        tracker.wait().await;
        tracing::info!("Engine stopped");
    }

    fn dispatch(&self, job: Job, tracker: &TaskTracker, shutdown: &CancellationToken) {
        self.metrics.record_job_received();
        tracing::debug!(job_id = %job.job_id, query_type = %job.query_type, "Job received");

        let registry = self.registry.clone();
        let source = Arc::clone(&self.source);
        let metrics = Arc::clone(&self.metrics);
        let context = Context::with_shutdown(&job.job_id, shutdown.child_token());

        let task = tracker.track_future(async move {
            let started = Instant::now();
            let job_id = job.job_id.clone();
            let result = match AssertUnwindSafe(execute(&registry, &metrics, context, job))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    JobResult::failed(job_id, JobError::Panicked(panic_message(&*panic)))
                }
            };
            complete(source.as_ref(), &metrics, result, started).await;
        });

        self.executor.submit(Box::pin(task));
    }
}

async fn execute(
    registry: &Registry,
    metrics: &EngineMetrics,
    context: Context,
    job: Job,
) -> JobResult {
    let Some(runner) = registry.lookup(&job.query_type) else {
        metrics.record_function_not_found();
        tracing::warn!(
            job_id = %job.job_id,
            requested = %job.query_type,
            "Requested function not found"
        );
        return JobResult::failed(
            job.job_id,
            JobError::FunctionNotFound {
                requested: job.query_type,
                known: registry.names(),
            },
        );
    };

    runner.execute(context, job.query).await
}

/// Render and post one result. Runs exactly once per job.
async fn complete(
    source: &dyn JobSource,
    metrics: &EngineMetrics,
    result: JobResult,
    started: Instant,
) {
    let result = result.reject_empty();
    let job_id = result.job_id().to_owned();
    let ok = result.is_ok();
    if let JobResult::Failed { error, .. } = &result {
        tracing::warn!(job_id = %job_id, error = %error, "Job failed");
    }

    let payload = result.into_payload();
    metrics.record_job_finished(ok, started.elapsed());

    let posted = AssertUnwindSafe(async { source.post_result(&job_id, payload).await })
        .catch_unwind()
        .await;
    match posted {
        Ok(Ok(())) => tracing::debug!(job_id = %job_id, ok, "Result posted"),
        Ok(Err(e)) => {
            metrics.record_post_failure();
            tracing::error!(job_id = %job_id, error = %e, "Failed to post result");
        }
        Err(panic) => {
            metrics.record_post_failure();
            tracing::error!(
                job_id = %job_id,
                panic = %panic_message(&*panic),
                "Job source panicked while posting result"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;

    use super::*;
    use crate::error::{BoxError, SourceError};
    use crate::source::InMemoryJobSource;

    async fn dub(_ctx: Context, input: i64) -> Result<i64, BoxError> {
        Ok(input * 2)
    }

    /// Yields a scripted sequence of poll outcomes, then idles. Records posts.
    struct ScriptedSource {
        script: Mutex<Vec<Result<Option<Job>, SourceError>>>,
        panic_on_poll: AtomicUsize,
        fail_posts: bool,
        posts: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl ScriptedSource {
        fn new(mut script: Vec<Result<Option<Job>, SourceError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                panic_on_poll: AtomicUsize::new(0),
                fail_posts: false,
                posts: Mutex::new(Vec::new()),
            }
        }
    }

    impl JobSource for ScriptedSource {
        fn get_job(&self) -> BoxFuture<'_, Result<Option<Job>, SourceError>> {
            Box::pin(async move {
                if self
                    .panic_on_poll
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    panic!("poll exploded");
                }
                let next = self.script.lock().unwrap().pop();
                match next {
                    Some(outcome) => outcome,
                    None => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(None)
                    }
                }
            })
        }

        fn post_result<'a>(
            &'a self,
            job_id: &'a str,
            payload: Vec<u8>,
        ) -> BoxFuture<'a, Result<(), SourceError>> {
            Box::pin(async move {
                self.posts
                    .lock()
                    .unwrap()
                    .push((job_id.to_string(), payload));
                if self.fail_posts {
                    Err(SourceError::Transport("sidecar unreachable".into()))
                } else {
                    Ok(())
                }
            })
        }
    }

    async fn run_briefly(engine: Engine) {
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.cancel();
        });
        engine.run(shutdown).await;
    }

    #[test]
    fn duplicate_registration_fails_build() {
        let result = Engine::builder(InMemoryJobSource::new())
            .add("dub", dub)
            .add("dub", dub)
            .build();
        assert!(matches!(result, Err(EngineError::DuplicateFunction(_))));
    }

    #[tokio::test]
    async fn poll_errors_and_panics_do_not_stop_the_loop() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(SourceError::Transport("connection refused".into())),
            Ok(None),
            Ok(Some(Job::new("j-1", "dub", serde_json::json!(21)))),
        ]));
        source.panic_on_poll.store(1, Ordering::SeqCst);

        let engine = Engine::builder(Arc::clone(&source))
            .add("dub", dub)
            .build()
            .unwrap();
        let metrics = engine.metrics();

        run_briefly(engine).await;

        let posts = source.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0], ("j-1".to_string(), b"42".to_vec()));

        let snap = metrics.snapshot();
        assert_eq!(snap.poll_errors, 2);
        assert_eq!(snap.jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn failed_post_is_logged_not_retried() {
        let mut source = ScriptedSource::new(vec![
            Ok(Some(Job::new("j-1", "dub", serde_json::json!(1)))),
            Ok(Some(Job::new("j-2", "dub", serde_json::json!(2)))),
        ]);
        source.fail_posts = true;
        let source = Arc::new(source);

        let engine = Engine::builder(Arc::clone(&source))
            .add("dub", dub)
            .build()
            .unwrap();
        let metrics = engine.metrics();

        run_briefly(engine).await;

        assert_eq!(source.posts.lock().unwrap().len(), 2);
        let snap = metrics.snapshot();
        assert_eq!(snap.post_failures, 2);
        assert_eq!(snap.jobs_received, 2);
        assert_eq!(snap.jobs_in_flight, 0);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_jobs() {
        let source = Arc::new(InMemoryJobSource::new());
        let slow = |ctx: Context, input: i64| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(ctx.shutdown_token().is_cancelled());
            Ok::<_, BoxError>(input + 1)
        };
        let engine = Engine::builder(Arc::clone(&source))
            .add("slow", slow)
            .build()
            .unwrap();

        let id = source.submit("slow", 1).unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(engine.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(source.post_count(), 1);
        let value: i64 = source.result_as(&id).await.unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn custom_executor_receives_every_job() {
        struct Counting {
            inner: TokioExecutor,
            submitted: Arc<AtomicUsize>,
        }

        impl TaskExecutor for Counting {
            fn submit(&self, task: BoxFuture<'static, ()>) {
                self.submitted.fetch_add(1, Ordering::SeqCst);
                self.inner.submit(task);
            }
        }

        let submitted = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(InMemoryJobSource::new());
        let engine = Engine::builder(Arc::clone(&source))
            .add("dub", dub)
            .with_executor(Counting {
                inner: TokioExecutor::new(),
                submitted: Arc::clone(&submitted),
            })
            .build()
            .unwrap();
        tokio::spawn(engine.start());

        for n in 0..3 {
            let out: i64 = source.execute_as("dub", n).await.unwrap();
            assert_eq!(out, n * 2);
        }
        assert_eq!(submitted.load(Ordering::SeqCst), 3);
    }

    /// Panics while building the poll or post future, before any await.
    struct EagerPanicSource {
        inner: InMemoryJobSource,
        poll_panics: AtomicUsize,
        post_panics: AtomicUsize,
    }

    impl JobSource for EagerPanicSource {
        fn get_job(&self) -> BoxFuture<'_, Result<Option<Job>, SourceError>> {
            if self
                .poll_panics
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                panic!("get_job exploded before returning a future");
            }
            self.inner.get_job()
        }

        fn post_result<'a>(
            &'a self,
            job_id: &'a str,
            payload: Vec<u8>,
        ) -> BoxFuture<'a, Result<(), SourceError>> {
            if self
                .post_panics
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                panic!("post_result exploded before returning a future");
            }
            self.inner.post_result(job_id, payload)
        }
    }

    #[tokio::test]
    async fn eager_panics_in_source_are_contained() {
        let source = Arc::new(EagerPanicSource {
            inner: InMemoryJobSource::new(),
            poll_panics: AtomicUsize::new(1),
            post_panics: AtomicUsize::new(1),
        });
        let engine = Engine::builder(Arc::clone(&source))
            .add("dub", dub)
            .build()
            .unwrap();
        let metrics = engine.metrics();
        let handle = tokio::spawn(engine.start());

        // The first post panics and is lost; later jobs still go through.
        source.inner.submit("dub", 1).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while metrics.snapshot().post_failures == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first post should fail");

        let id = source.inner.submit("dub", 2).unwrap();
        let value = tokio::time::timeout(Duration::from_secs(2), source.inner.result_as::<i64>(&id))
            .await
            .expect("engine should keep polling")
            .unwrap();
        assert_eq!(value, 4);
        assert!(!handle.is_finished());

        let snap = metrics.snapshot();
        assert_eq!(snap.poll_errors, 1);
        assert_eq!(snap.post_failures, 1);
        assert_eq!(source.inner.post_count(), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn empty_output_is_never_posted() {
        let source = Arc::new(InMemoryJobSource::new());
        let empty = |_ctx: Context, _input: serde_json::Value| async move {
            Ok::<_, BoxError>(Vec::new())
        };
        let engine = Engine::builder(Arc::clone(&source))
            .add_raw("empty", empty)
            .build()
            .unwrap();
        let metrics = engine.metrics();
        tokio::spawn(engine.start());

        let payload = source.execute("empty", serde_json::Value::Null).await.unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.contains("function produced an empty payload"));
        assert_eq!(metrics.snapshot().jobs_failed, 1);
    }
}
