#![forbid(unsafe_code)]

mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use opforge_ai::Platform;
use opforge_core::{Clock, SystemClock};
use opforge_infra::ai::{AdapterRegistry, Capability, PipelineRunner, RegistryEvidenceSource};
use opforge_infra::db::{PgEvidenceAdapter, PgLeaseStore, PgResultSink};
use opforge_infra::external::HttpSynthesisClient;
use opforge_infra::jobs::JobQueue;
use opforge_infra::workers::{JobWorker, ShutdownSignal};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    opforge_observability::init_with(cli.log_format);

    let engine = cli.engine_config()?;
    let worker_config = cli.worker_config(&engine)?;
    info!(
        worker_id = %worker_config.worker_id,
        run_mode = ?worker_config.run_mode,
        max_attempts = engine.queue.max_attempts,
        stale_threshold_secs = engine.queue.stale_threshold.as_secs(),
        min_ready_items = engine.pipeline.min_ready_items,
        "starting opforge worker"
    );

    let pool = PgPoolOptions::new()
        .max_connections(cli.db_max_connections)
        .connect(&cli.database_url)
        .await
        .context("failed to connect to database")?;
    let pool = Arc::new(pool);

    let store = PgLeaseStore::from_arc(pool.clone());
    store.ensure_schema().await.context("failed to prepare jobs table")?;
    let evidence = Arc::new(PgEvidenceAdapter::from_arc(pool.clone()));
    evidence
        .ensure_schema()
        .await
        .context("failed to prepare evidence table")?;
    let sink = Arc::new(PgResultSink::from_arc(pool.clone()));
    sink.ensure_schema()
        .await
        .context("failed to prepare results table")?;

    let mut registry = AdapterRegistry::new();
    for platform in Platform::ALL {
        for capability in Capability::ALL {
            registry.register(platform, capability, evidence.clone());
        }
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let synthesis = HttpSynthesisClient::new(cli.endpoint()).context("failed to build synthesis client")?;
    let runner = PipelineRunner::new(
        Arc::new(RegistryEvidenceSource::new(registry)),
        Arc::new(synthesis),
        sink,
        clock.clone(),
    )
    .with_gate(engine.gate.clone())
    .with_config(engine.pipeline.clone());

    let queue = Arc::new(JobQueue::new(store, clock, engine.queue.clone()));
    let shutdown = Arc::new(ShutdownSignal::new());
    let mut handle = JobWorker::new(queue, Arc::new(runner), worker_config).spawn(shutdown.clone());

    let stats = tokio::select! {
        joined = &mut handle => joined.context("worker task failed")?,
        signal = wait_for_shutdown_signal() => {
            signal?;
            info!("shutdown requested; finishing in-flight job");
            shutdown.trigger();
            handle.await.context("worker task failed")?
        }
    };

    info!(
        stats = %serde_json::to_string(&stats)?,
        "opforge worker exited"
    );
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("register SIGTERM")?;
        let mut sigint = signal(SignalKind::interrupt()).context("register SIGINT")?;
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    }
    Ok(())
}
