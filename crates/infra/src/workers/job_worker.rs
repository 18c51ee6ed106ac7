use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use opforge_ai::{ErrorCategory, FailureDetail};
use opforge_core::{JobId, WorkerId};

use crate::ai::{PipelineRunner, ProgressSink, RunOutcome};
use crate::config::HeartbeatConfig;
use crate::jobs::{FailDisposition, HeartbeatHandle, Job, JobQueue, LeaseStore};

/// When the worker loop exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Until a shutdown signal.
    #[default]
    UntilStopped,
    /// After exactly one claimed job.
    Once,
    /// After this many claimed jobs.
    MaxJobs(u64),
}

impl RunMode {
    fn is_done(&self, processed: u64) -> bool {
        match self {
            RunMode::UntilStopped => false,
            RunMode::Once => processed >= 1,
            RunMode::MaxJobs(n) => processed >= *n,
        }
    }
}

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Sleep between polls that found nothing
    pub poll_interval: Duration,
    /// How often to sweep stale leases before polling
    pub stale_check_interval: Duration,
    pub run_mode: RunMode,
    pub heartbeat: HeartbeatConfig,
}

impl WorkerConfig {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            poll_interval: Duration::from_secs(2),
            stale_check_interval: Duration::from_secs(60),
            run_mode: RunMode::UntilStopped,
            heartbeat: HeartbeatConfig::default(),
        }
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Cooperative stop request shared between the signal handler and the loop.
///
/// The loop checks it between jobs; an in-flight job always finishes first.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}

/// How one claimed job ended, from the worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Succeeded { degraded: bool },
    InsufficientEvidence,
    Retrying,
    Failed,
    /// The terminal call found the lease gone; someone else owns the job now.
    LeaseLost,
    /// The terminal call itself errored; the stale sweep will recover the job.
    Unreported,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub polls: u64,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_degraded: u64,
    pub jobs_insufficient_evidence: u64,
    pub jobs_retrying: u64,
    pub jobs_failed: u64,
    pub leases_lost: u64,
    pub reports_failed: u64,
    pub stale_released: u64,
}

impl WorkerStats {
    fn record(&mut self, disposition: JobDisposition) {
        self.jobs_processed += 1;
        match disposition {
            JobDisposition::Succeeded { degraded } => {
                self.jobs_succeeded += 1;
                if degraded {
                    self.jobs_degraded += 1;
                }
            }
            JobDisposition::InsufficientEvidence => self.jobs_insufficient_evidence += 1,
            JobDisposition::Retrying => self.jobs_retrying += 1,
            JobDisposition::Failed => self.jobs_failed += 1,
            JobDisposition::LeaseLost => self.leases_lost += 1,
            JobDisposition::Unreported => self.reports_failed += 1,
        }
    }
}

/// Writes runner stage notes onto the job row.
struct QueueProgress<S: LeaseStore> {
    queue: Arc<JobQueue<S>>,
    job_id: JobId,
    worker_id: WorkerId,
}

#[async_trait]
impl<S: LeaseStore + 'static> ProgressSink for QueueProgress<S> {
    async fn report(&self, stage: &str, detail: Option<String>) {
        match self
            .queue
            .report_progress(self.job_id, &self.worker_id, stage, detail)
            .await
        {
            Ok(true) => debug!(job_id = %self.job_id, stage, "progress recorded"),
            Ok(false) => debug!(job_id = %self.job_id, stage, "progress skipped: lease not held"),
            Err(err) => warn!(job_id = %self.job_id, stage, error = %err, "progress update failed"),
        }
    }
}

/// Single-job-at-a-time worker.
///
/// `POLL -> idle sleep | claim -> heartbeat -> run -> heartbeat stop -> terminal report`.
pub struct JobWorker<S: LeaseStore> {
    queue: Arc<JobQueue<S>>,
    runner: Arc<PipelineRunner>,
    config: WorkerConfig,
}

impl<S: LeaseStore + 'static> JobWorker<S> {
    pub fn new(queue: Arc<JobQueue<S>>, runner: Arc<PipelineRunner>, config: WorkerConfig) -> Self {
        Self {
            queue,
            runner,
            config,
        }
    }

    /// Run the loop on a background task.
    pub fn spawn(self, shutdown: Arc<ShutdownSignal>) -> JoinHandle<WorkerStats> {
        tokio::spawn(async move { self.run(&shutdown).await })
    }

    pub async fn run(&self, shutdown: &ShutdownSignal) -> WorkerStats {
        let worker_id = &self.config.worker_id;
        info!(worker_id = %worker_id, run_mode = ?self.config.run_mode, "job worker started");

        let mut stats = WorkerStats::default();
        let mut last_sweep: Option<Instant> = None;

        while !shutdown.is_requested() && !self.config.run_mode.is_done(stats.jobs_processed) {
            if last_sweep.is_none_or(|at| at.elapsed() >= self.config.stale_check_interval) {
                match self.queue.release_stale_jobs().await {
                    Ok(released) => stats.stale_released += released as u64,
                    Err(err) => warn!(worker_id = %worker_id, error = %err, "stale sweep failed"),
                }
                last_sweep = Some(Instant::now());
            }

            stats.polls += 1;
            match self.queue.claim_next(worker_id).await {
                Ok(Some(job)) => {
                    let disposition = self.process(job).await;
                    stats.record(disposition);
                }
                Ok(None) => self.idle(shutdown).await,
                Err(err) => {
                    error!(worker_id = %worker_id, error = %err, "failed to claim job");
                    self.idle(shutdown).await;
                }
            }
        }

        info!(
            worker_id = %worker_id,
            polls = stats.polls,
            processed = stats.jobs_processed,
            succeeded = stats.jobs_succeeded,
            failed = stats.jobs_failed,
            "job worker stopped"
        );
        stats
    }

    async fn idle(&self, shutdown: &ShutdownSignal) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = shutdown.wait() => {}
        }
    }

    /// Execute a claimed job and make exactly one terminal call for it.
    pub async fn process(&self, job: Job) -> JobDisposition {
        let job_id = job.id;
        let worker_id = self.config.worker_id.clone();

        let heartbeat =
            HeartbeatHandle::spawn(self.queue.clone(), job_id, worker_id.clone(), self.config.heartbeat);

        let runner = self.runner.clone();
        let progress = QueueProgress {
            queue: self.queue.clone(),
            job_id,
            worker_id: worker_id.clone(),
        };
        let params = job.params.clone();
        // Own task: a panic in the runner becomes a JoinError, not a dead worker.
        let outcome = tokio::spawn(async move { runner.run(job_id, &params, &progress).await }).await;

        let beat = heartbeat.stop().await;
        if beat.lock_lost {
            warn!(job_id = %job_id, worker_id = %worker_id, "lease was lost while running");
        }

        let disposition = match outcome {
            Ok(RunOutcome::Committed { result_ref, result }) => {
                let degraded = result.quality.is_degraded();
                match self
                    .queue
                    .complete_job(job_id, &worker_id, result_ref, result.summary())
                    .await
                {
                    Ok(true) => JobDisposition::Succeeded { degraded },
                    Ok(false) => JobDisposition::LeaseLost,
                    Err(err) => self.unreported(job_id, err),
                }
            }
            Ok(RunOutcome::InsufficientEvidence(report)) => {
                let summary = report.summary();
                let detail = json!({
                    "kind": "insufficient_evidence",
                    "summary": summary,
                    "remediation": report.remediation(),
                    "report": report,
                });
                match self
                    .queue
                    .fail_insufficient_evidence(job_id, &worker_id, &summary, detail)
                    .await
                {
                    Ok(true) => JobDisposition::InsufficientEvidence,
                    Ok(false) => JobDisposition::LeaseLost,
                    Err(err) => self.unreported(job_id, err),
                }
            }
            Ok(RunOutcome::Failed(err)) => self.fail(&job, &err.to_string(), err.detail()).await,
            Err(join_err) => {
                let message = format!("pipeline panicked: {join_err}");
                error!(job_id = %job_id, worker_id = %worker_id, error = %message, "runner task failed");
                let detail = FailureDetail::new(ErrorCategory::Unknown, message.clone());
                self.fail(&job, &message, detail).await
            }
        };

        debug!(job_id = %job_id, disposition = ?disposition, extensions = beat.extensions, "job finished");
        disposition
    }

    async fn fail(&self, job: &Job, message: &str, detail: FailureDetail) -> JobDisposition {
        let detail = json!({
            "kind": "failed",
            "category": detail.category,
            "message": detail.message,
            "hint": detail.hint,
        });
        match self
            .queue
            .fail_job(job.id, &self.config.worker_id, message, Some(detail))
            .await
        {
            Ok(FailDisposition::Retrying { .. }) => JobDisposition::Retrying,
            Ok(FailDisposition::Exhausted { .. }) => JobDisposition::Failed,
            Ok(FailDisposition::NotHeld) => JobDisposition::LeaseLost,
            Err(err) => self.unreported(job.id, err),
        }
    }

    fn unreported(&self, job_id: JobId, err: impl std::fmt::Display) -> JobDisposition {
        error!(
            job_id = %job_id,
            worker_id = %self.config.worker_id,
            error = %err,
            "terminal report failed; job will be recovered by the stale sweep"
        );
        JobDisposition::Unreported
    }
}
