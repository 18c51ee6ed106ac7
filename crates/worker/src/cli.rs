//! Command-line flags and their resolution into engine configuration.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

use opforge_core::WorkerId;
use opforge_infra::config::{EngineConfig, SynthesisEndpointConfig};
use opforge_infra::jobs::RetryPolicy;
use opforge_infra::workers::{RunMode, WorkerConfig};
use opforge_observability::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "opforge-worker")]
#[command(about = "Claims synthesis jobs from the queue and runs them")]
pub struct Cli {
    #[arg(long, env = "OPFORGE_DATABASE_URL", hide_env_values = true)]
    pub database_url: String,
    #[arg(long, env = "OPFORGE_DB_MAX_CONNECTIONS", default_value_t = 5)]
    pub db_max_connections: u32,

    /// Defaults to `<hostname>-<pid>`.
    #[arg(long, env = "OPFORGE_WORKER_ID")]
    pub worker_id: Option<String>,
    /// Process one job and exit.
    #[arg(long, default_value_t = false, conflicts_with = "max_jobs")]
    pub once: bool,
    /// Exit after this many jobs.
    #[arg(long, env = "OPFORGE_MAX_JOBS")]
    pub max_jobs: Option<u64>,
    #[arg(long, env = "OPFORGE_POLL_INTERVAL_SECS", default_value_t = 2)]
    pub poll_interval_secs: u64,
    #[arg(long, env = "OPFORGE_STALE_CHECK_INTERVAL_SECS", default_value_t = 60)]
    pub stale_check_interval_secs: u64,
    #[arg(long, env = "OPFORGE_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    #[arg(long, env = "OPFORGE_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,
    #[arg(long, env = "OPFORGE_BACKOFF_BASE_SECS", default_value_t = 30)]
    pub backoff_base_secs: u64,
    #[arg(long, env = "OPFORGE_BACKOFF_CEILING_SECS")]
    pub backoff_ceiling_secs: Option<u64>,
    #[arg(long, env = "OPFORGE_STALE_THRESHOLD_SECS", default_value_t = 600)]
    pub stale_threshold_secs: u64,
    #[arg(long, env = "OPFORGE_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "OPFORGE_KERNEL_DEADLINE_SECS", default_value_t = 8)]
    pub kernel_deadline_secs: u64,
    #[arg(long, env = "OPFORGE_EXPANSION_DEADLINE_SECS", default_value_t = 20)]
    pub expansion_deadline_secs: u64,
    #[arg(long, env = "OPFORGE_MAX_CONCURRENCY", default_value_t = 4)]
    pub max_concurrency: usize,
    #[arg(long, env = "OPFORGE_MIN_READY_ITEMS", default_value_t = 3)]
    pub min_ready_items: usize,
    /// Defaults to `--min-ready-items`.
    #[arg(long, env = "OPFORGE_TARGET_READY_ITEMS")]
    pub target_ready_items: Option<usize>,
    #[arg(long, env = "OPFORGE_MAX_EXPANSIONS", default_value_t = 8)]
    pub max_expansions: usize,
    /// Wait for every expansion instead of stopping at `--min-ready-items`.
    #[arg(long, env = "OPFORGE_WAIT_FOR_ALL", default_value_t = false)]
    pub wait_for_all: bool,
    #[arg(long, env = "OPFORGE_GATE_MIN_ITEMS", default_value_t = 8)]
    pub gate_min_items: usize,
    #[arg(long, env = "OPFORGE_GATE_MIN_AUTHORS", default_value_t = 3)]
    pub gate_min_authors: usize,

    #[arg(long, env = "OPFORGE_LLM_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub llm_base_url: String,
    #[arg(long, env = "OPFORGE_LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,
    #[arg(long, env = "OPFORGE_FAST_MODEL", default_value = "gpt-4o-mini")]
    pub fast_model: String,
    #[arg(long, env = "OPFORGE_HEAVY_MODEL", default_value = "gpt-4o")]
    pub heavy_model: String,
}

impl Cli {
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::default();

        if self.max_attempts == 0 {
            bail!("--max-attempts must be at least 1");
        }
        config.queue.max_attempts = self.max_attempts;
        config.queue.retry = RetryPolicy {
            base_delay: Duration::from_secs(self.backoff_base_secs),
            max_delay: self.backoff_ceiling_secs.map(Duration::from_secs),
        };
        config.queue.stale_threshold = Duration::from_secs(self.stale_threshold_secs);
        config.heartbeat.interval = Duration::from_secs(self.heartbeat_interval_secs);
        if config.heartbeat.interval >= config.queue.stale_threshold {
            bail!("heartbeat interval must be shorter than the stale threshold");
        }

        if self.min_ready_items == 0 {
            bail!("--min-ready-items must be at least 1");
        }
        let pipeline = &mut config.pipeline;
        pipeline.kernel_deadline = Duration::from_secs(self.kernel_deadline_secs);
        pipeline.expansion_deadline = Duration::from_secs(self.expansion_deadline_secs);
        pipeline.max_concurrency = self.max_concurrency.max(1);
        pipeline.min_ready_items = self.min_ready_items;
        pipeline.target_ready_items = self.target_ready_items.unwrap_or(self.min_ready_items);
        pipeline.max_expansions = self.max_expansions;
        pipeline.stop_at_min_ready = !self.wait_for_all;
        if pipeline.target_ready_items < pipeline.min_ready_items {
            bail!("--target-ready-items must be at least --min-ready-items");
        }
        if pipeline.min_expansions > pipeline.max_expansions {
            pipeline.min_expansions = pipeline.max_expansions;
        }

        config.gate.quality.min_items = self.gate_min_items;
        config.gate.usability.min_distinct_authors = self.gate_min_authors;
        Ok(config)
    }

    pub fn worker_config(&self, engine: &EngineConfig) -> Result<WorkerConfig> {
        let worker_id = match &self.worker_id {
            Some(id) => WorkerId::new(id.clone())?,
            None => WorkerId::new(default_worker_id())?,
        };
        let run_mode = match (self.once, self.max_jobs) {
            (true, _) => RunMode::Once,
            (false, Some(n)) => RunMode::MaxJobs(n),
            (false, None) => RunMode::UntilStopped,
        };

        let mut config = WorkerConfig::new(worker_id)
            .with_run_mode(run_mode)
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs));
        config.stale_check_interval = Duration::from_secs(self.stale_check_interval_secs);
        config.heartbeat = engine.heartbeat;
        Ok(config)
    }

    pub fn endpoint(&self) -> SynthesisEndpointConfig {
        SynthesisEndpointConfig {
            base_url: self.llm_base_url.clone(),
            api_key: self.llm_api_key.clone().filter(|k| !k.trim().is_empty()),
            fast_model: self.fast_model.clone(),
            heavy_model: self.heavy_model.clone(),
            ..Default::default()
        }
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}
