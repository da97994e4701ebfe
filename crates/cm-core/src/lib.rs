//! Job execution engine for compute modules.
//!
//! An [`Engine`] polls a [`JobSource`] for jobs, routes each one by its
//! `queryType` to a function registered under that name, and posts back either
//! the encoded output or a failure diagnostic.
//!
//! ```no_run
//! use cm_core::{BoxError, Context, Engine, InMemoryJobSource};
//!
//! async fn dub(_ctx: Context, input: i64) -> Result<i64, BoxError> {
//!     Ok(input * 2)
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::builder(InMemoryJobSource::new())
//!     .add("dub", dub)
//!     .build()?;
//! engine.start().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod engine;
pub mod error;
pub mod executor;
pub mod job;
pub mod metrics;
pub mod registry;
pub mod result;
pub mod runner;
pub mod source;

pub use codec::{Deserializer, JsonCodec, Serializer};
pub use engine::{Engine, EngineBuilder};
pub use error::{BoxError, CodecError, EngineError, JobError, SourceError};
pub use executor::{BoundedExecutor, TaskExecutor, TokioExecutor};
pub use job::{Context, Job};
pub use metrics::{
    EngineMetrics, LoggingMetricsBackend, METRICS_LOG_TARGET, MetricsBackend, MetricsSnapshot,
};
pub use registry::{Registry, RegistryBuilder};
pub use result::{JobResult, render_diagnostic};
pub use runner::{Function, FunctionRunner, Runner};
pub use source::{InMemoryJobSource, JobSource};

pub use tokio_util::sync::CancellationToken;
