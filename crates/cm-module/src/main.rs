use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use cm_client::{HttpJobSource, ModuleConfig};
use cm_core::{BoundedExecutor, CancellationToken, Engine, EngineMetrics, LoggingMetricsBackend};
use tracing_subscriber::{EnvFilter, fmt};

mod functions;

#[derive(Parser)]
#[command(
    name = "compute-module",
    about = "Compute module: polls the runtime for jobs and runs registered functions"
)]
struct Cli {
    /// TOML config file; the runtime's environment variables are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Upper bound on jobs running at once (unbounded by default)
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Log every metric update under the `cm_metrics` target
    #[arg(long)]
    log_metrics: bool,
}

fn engine_metrics(log_metrics: bool) -> Arc<EngineMetrics> {
    if log_metrics {
        Arc::new(EngineMetrics::with_backend(Arc::new(LoggingMetricsBackend)))
    } else {
        Arc::new(EngineMetrics::new())
    }
}

fn init_logging(json: bool) {
    // Logs go to stderr; stdout belongs to the functions.
    let filter = EnvFilter::from_env("CM_LOG");
    if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = match &cli.config {
        Some(path) => ModuleConfig::from_file(path)?,
        None => ModuleConfig::from_env()?,
    };

    let mut source = HttpJobSource::new(&config)?;
    if let Some(provider) = config.build_token_provider()? {
        source = source.with_token_provider(provider);
    }

    let metrics = engine_metrics(cli.log_metrics);
    let mut builder =
        functions::register(Engine::builder(source)).with_metrics(Arc::clone(&metrics));
    if let Some(max) = cli.max_concurrency.or(config.max_concurrency) {
        builder = builder.with_executor(BoundedExecutor::new(max));
    }
    let engine = builder.build()?;

    tracing::info!(
        get_job_uri = %config.get_job_uri,
        post_result_uri = %config.post_result_uri,
        max_concurrency = ?cli.max_concurrency.or(config.max_concurrency),
        "Starting compute module"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl-C, draining in-flight jobs");
                shutdown.cancel();
            }
        }
    });

    engine.run(shutdown).await;

    tracing::info!(metrics = ?metrics.snapshot(), "Compute module stopped");
    Ok(())
}
