use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Trait for metrics backends. Implementations can forward to Prometheus,
/// StatsD, or simply log metrics.
pub trait MetricsBackend: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_gauge(&self, name: &str, value: f64);
    fn record_histogram(&self, name: &str, value: f64);
}

/// Atomic engine counters, shared between the poll loop and job tasks.
pub struct EngineMetrics {
    pub jobs_received: AtomicU64,
    pub jobs_succeeded: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub functions_not_found: AtomicU64,
    pub post_failures: AtomicU64,
    pub poll_errors: AtomicU64,
    pub jobs_in_flight: AtomicU64,
    backend: Option<Arc<dyn MetricsBackend>>,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("jobs_received", &self.jobs_received)
            .field("jobs_succeeded", &self.jobs_succeeded)
            .field("jobs_failed", &self.jobs_failed)
            .field("functions_not_found", &self.functions_not_found)
            .field("post_failures", &self.post_failures)
            .field("poll_errors", &self.poll_errors)
            .field("jobs_in_flight", &self.jobs_in_flight)
            .finish()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            jobs_received: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            functions_not_found: AtomicU64::new(0),
            post_failures: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
            jobs_in_flight: AtomicU64::new(0),
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    pub fn record_job_received(&self) {
        let val = self.jobs_received.fetch_add(1, Ordering::Relaxed) + 1;
        let in_flight = self.jobs_in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter("cm.engine.jobs_received", val);
            backend.record_gauge("cm.engine.jobs_in_flight", in_flight as f64);
        }
    }

    pub fn record_job_finished(&self, ok: bool, elapsed: Duration) {
        let counter = if ok {
            &self.jobs_succeeded
        } else {
            &self.jobs_failed
        };
        let val = counter.fetch_add(1, Ordering::Relaxed) + 1;
        let in_flight = self
            .jobs_in_flight
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        if let Some(backend) = &self.backend {
            let name = if ok {
                "cm.engine.jobs_succeeded"
            } else {
                "cm.engine.jobs_failed"
            };
            backend.record_counter(name, val);
            backend.record_gauge("cm.engine.jobs_in_flight", in_flight as f64);
            backend.record_histogram("cm.engine.job_duration_ms", elapsed.as_secs_f64() * 1000.0);
        }
    }

    pub fn record_function_not_found(&self) {
        let val = self.functions_not_found.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter("cm.engine.functions_not_found", val);
        }
    }

    pub fn record_post_failure(&self) {
        let val = self.post_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter("cm.engine.post_failures", val);
        }
    }

    pub fn record_poll_error(&self) {
        let val = self.poll_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter("cm.engine.poll_errors", val);
        }
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_received: self.jobs_received.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            functions_not_found: self.functions_not_found.load(Ordering::Relaxed),
            post_failures: self.post_failures.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            jobs_in_flight: self.jobs_in_flight.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of engine metrics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub jobs_received: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub functions_not_found: u64,
    pub post_failures: u64,
    pub poll_errors: u64,
    pub jobs_in_flight: u64,
}

/// Target used by [`LoggingMetricsBackend`], e.g. `CM_LOG=cm_metrics=info`.
pub const METRICS_LOG_TARGET: &str = "cm_metrics";

/// Writes every metric update as a `tracing` event under
/// [`METRICS_LOG_TARGET`], so metrics can be filtered apart from engine logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMetricsBackend;

impl MetricsBackend for LoggingMetricsBackend {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::info!(target: METRICS_LOG_TARGET, metric = name, kind = "counter", value);
    }

    fn record_gauge(&self, name: &str, value: f64) {
        tracing::info!(target: METRICS_LOG_TARGET, metric = name, kind = "gauge", value);
    }

    fn record_histogram(&self, name: &str, value: f64) {
        tracing::debug!(target: METRICS_LOG_TARGET, metric = name, kind = "histogram", value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recording {
        counters: Mutex<Vec<(String, u64)>>,
    }

    impl MetricsBackend for Recording {
        fn record_counter(&self, name: &str, value: u64) {
            self.counters.lock().unwrap().push((name.to_string(), value));
        }
        fn record_gauge(&self, _name: &str, _value: f64) {}
        fn record_histogram(&self, _name: &str, _value: f64) {}
    }

    #[test]
    fn default_metrics_start_at_zero() {
        let snap = EngineMetrics::new().snapshot();
        assert_eq!(snap.jobs_received, 0);
        assert_eq!(snap.jobs_succeeded, 0);
        assert_eq!(snap.jobs_in_flight, 0);
    }

    #[test]
    fn in_flight_tracks_received_minus_finished() {
        let metrics = EngineMetrics::new();
        metrics.record_job_received();
        metrics.record_job_received();
        metrics.record_job_finished(true, Duration::from_millis(3));

        let snap = metrics.snapshot();
        assert_eq!(snap.jobs_received, 2);
        assert_eq!(snap.jobs_succeeded, 1);
        assert_eq!(snap.jobs_in_flight, 1);

        metrics.record_job_finished(false, Duration::from_millis(1));
        let snap = metrics.snapshot();
        assert_eq!(snap.jobs_failed, 1);
        assert_eq!(snap.jobs_in_flight, 0);
    }

    #[test]
    fn backend_receives_counter_names() {
        let backend = Arc::new(Recording::default());
        let metrics = EngineMetrics::with_backend(backend.clone());
        metrics.record_post_failure();
        metrics.record_poll_error();
        metrics.record_function_not_found();

        let counters = backend.counters.lock().unwrap();
        let names: Vec<&str> = counters.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "cm.engine.post_failures",
                "cm.engine.poll_errors",
                "cm.engine.functions_not_found"
            ]
        );
    }

    #[test]
    fn concurrent_increments() {
        let metrics = Arc::new(EngineMetrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = Arc::clone(&metrics);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    m.record_job_received();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.snapshot().jobs_received, 1000);
    }

    #[test]
    fn logging_backend_keeps_local_counters() {
        let metrics = EngineMetrics::with_backend(Arc::new(LoggingMetricsBackend));
        metrics.record_job_received();
        metrics.record_job_finished(false, Duration::from_millis(2));
        metrics.record_post_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.jobs_received, 1);
        assert_eq!(snap.jobs_failed, 1);
        assert_eq!(snap.post_failures, 1);
        assert_eq!(snap.jobs_in_flight, 0);
    }
}
