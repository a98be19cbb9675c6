use anyhow::Context;
use tracing::{info, warn};

use auditflow_infra::external::HttpPayloader;
use auditflow_infra::{WorkerConfig, build_provider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    auditflow_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    info!(
        backend = config.backend.name(),
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "starting auditflow worker"
    );

    // Queue backends and the HTTP payloader block; keep them off the async workers.
    let handle = tokio::runtime::Handle::current();
    let worker = tokio::task::spawn_blocking(move || -> anyhow::Result<auditflow_worker::Worker> {
        let provider = build_provider(&config.backend, config.lease, &handle)?;
        let payloader = HttpPayloader::new()?;
        auditflow_worker::start(&config, provider, payloader)
    })
    .await??;

    let token = worker.cancellation_token();
    let cancelled = tokio::task::spawn_blocking(move || {
        let _ = token.cancelled().recv();
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
        }
        _ = cancelled => warn!("worker stopped on its own"),
    }

    let stats = worker.stats();
    tokio::task::spawn_blocking(move || worker.shutdown()).await??;
    info!(leased = stats.leased, completed = stats.completed, "auditflow worker stopped");
    Ok(())
}
