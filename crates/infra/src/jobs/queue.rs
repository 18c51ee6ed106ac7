//! Job queue: claim, lease, retry and terminal transitions over a [`LeaseStore`].
//!
//! Every transition is one conditional update. Operations that lose the race
//! (the row no longer matches) report `false` instead of erroring, so callers
//! can retry any of them safely.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use opforge_core::{Clock, JobId, ResultRef, WorkerId};

use crate::config::QueueConfig;

use super::store::{JobOrder, JobPredicate, JobUpdate, LeaseStore, LeaseStoreError, LockChange};
use super::types::{Job, JobParams, JobStats, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] LeaseStoreError),
    #[error("job not found: {0}")]
    NotFound(JobId),
}

/// What `fail_job` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Back to PENDING; claimable from `available_at`.
    Retrying {
        attempts: u32,
        available_at: DateTime<Utc>,
    },
    /// Attempts exhausted; FAILED.
    Exhausted { attempts: u32 },
    /// The caller no longer holds the lease; nothing changed.
    NotHeld,
}

impl FailDisposition {
    pub fn applied(&self) -> bool {
        !matches!(self, FailDisposition::NotHeld)
    }
}

pub struct JobQueue<S: LeaseStore> {
    store: S,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl<S: LeaseStore> std::fmt::Debug for JobQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").field("config", &self.config).finish()
    }
}

impl<S: LeaseStore> JobQueue<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Insert a PENDING job, claimable immediately.
    pub async fn enqueue(&self, params: JobParams) -> Result<JobId, QueueError> {
        self.enqueue_with_attempts(params, self.config.max_attempts).await
    }

    pub async fn enqueue_with_attempts(
        &self,
        params: JobParams,
        max_attempts: u32,
    ) -> Result<JobId, QueueError> {
        let job = Job::new(params, max_attempts.max(1), self.clock.now());
        let id = job.id;
        self.store.insert(job).await?;
        debug!(job_id = %id, max_attempts, "job enqueued");
        Ok(id)
    }

    /// Claim the oldest due PENDING job for `worker_id`.
    ///
    /// Candidates are tried in order; each claim is conditional on the row
    /// still being PENDING and due, so at most one worker wins any job.
    pub async fn claim_next(&self, worker_id: &WorkerId) -> Result<Option<Job>, QueueError> {
        let now = self.clock.now();
        let predicate = JobPredicate::claimable(now);
        let candidates = self
            .store
            .query(&predicate, JobOrder::OldestAvailable, self.config.claim_candidates)
            .await?;

        for candidate in candidates {
            let update = JobUpdate::at(now)
                .status(JobStatus::Running)
                .lock(LockChange::Acquire {
                    worker_id: worker_id.clone(),
                    at: now,
                })
                .increment_attempts();

            if !self
                .store
                .conditional_update(candidate.id, &predicate, &update)
                .await?
            {
                debug!(job_id = %candidate.id, worker_id = %worker_id, "lost claim race");
                continue;
            }

            let job = self
                .store
                .get(candidate.id)
                .await?
                .ok_or(QueueError::NotFound(candidate.id))?;
            info!(
                job_id = %job.id,
                worker_id = %worker_id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                "job claimed"
            );
            return Ok(Some(job));
        }

        Ok(None)
    }

    /// Refresh the lease. `false` means the lock was lost.
    pub async fn extend_lock(&self, job_id: JobId, worker_id: &WorkerId) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let update = JobUpdate::at(now).lock(LockChange::Refresh { at: now });
        let extended = self
            .store
            .conditional_update(job_id, &JobPredicate::held_by(worker_id), &update)
            .await?;
        Ok(extended)
    }

    pub async fn complete_job(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        result_ref: ResultRef,
        outcome: Value,
    ) -> Result<bool, QueueError> {
        let update = JobUpdate::at(self.clock.now())
            .status(JobStatus::Succeeded)
            .lock(LockChange::Release)
            .result_ref(result_ref)
            .outcome(outcome)
            .finished();
        let applied = self
            .store
            .conditional_update(job_id, &JobPredicate::held_by(worker_id), &update)
            .await?;

        if applied {
            info!(job_id = %job_id, worker_id = %worker_id, result_ref = %result_ref, "job succeeded");
        } else {
            warn!(job_id = %job_id, worker_id = %worker_id, "complete ignored: lease not held");
        }
        Ok(applied)
    }

    /// Record a failed attempt: retry with backoff, or fail terminally once
    /// attempts are exhausted.
    pub async fn fail_job(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        error: &str,
        detail: Option<Value>,
    ) -> Result<FailDisposition, QueueError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))?;
        if !job.is_held_by(worker_id) {
            warn!(job_id = %job_id, worker_id = %worker_id, "fail ignored: lease not held");
            return Ok(FailDisposition::NotHeld);
        }

        let now = self.clock.now();
        let mut update = JobUpdate::at(now).lock(LockChange::Release).last_error(error);
        if let Some(detail) = detail {
            update = update.outcome(detail);
        }

        let disposition = if job.attempts_exhausted() {
            update = update.status(JobStatus::Failed).finished();
            FailDisposition::Exhausted {
                attempts: job.attempts,
            }
        } else {
            let available_at = self.config.retry.next_available_at(job.attempts, now);
            update = update.status(JobStatus::Pending).available_at(available_at);
            FailDisposition::Retrying {
                attempts: job.attempts,
                available_at,
            }
        };

        // Holding the lease pins `attempts`: it only changes on claim.
        if !self
            .store
            .conditional_update(job_id, &JobPredicate::held_by(worker_id), &update)
            .await?
        {
            warn!(job_id = %job_id, worker_id = %worker_id, "fail ignored: lease lost mid-update");
            return Ok(FailDisposition::NotHeld);
        }

        match disposition {
            FailDisposition::Retrying {
                attempts,
                available_at,
            } => warn!(
                job_id = %job_id,
                worker_id = %worker_id,
                attempt = attempts,
                max_attempts = job.max_attempts,
                retry_at = %available_at,
                error,
                "job failed, will retry"
            ),
            FailDisposition::Exhausted { attempts } => warn!(
                job_id = %job_id,
                worker_id = %worker_id,
                attempts,
                error,
                "job failed permanently"
            ),
            FailDisposition::NotHeld => {}
        }
        Ok(disposition)
    }

    /// Terminal, non-retryable: the evidence gate blocked the run.
    pub async fn fail_insufficient_evidence(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        summary: &str,
        detail: Value,
    ) -> Result<bool, QueueError> {
        let update = JobUpdate::at(self.clock.now())
            .status(JobStatus::InsufficientEvidence)
            .lock(LockChange::Release)
            .last_error(summary)
            .outcome(detail)
            .finished();
        let applied = self
            .store
            .conditional_update(job_id, &JobPredicate::held_by(worker_id), &update)
            .await?;

        if applied {
            info!(job_id = %job_id, worker_id = %worker_id, summary, "job blocked: insufficient evidence");
        } else {
            warn!(job_id = %job_id, worker_id = %worker_id, "insufficient-evidence ignored: lease not held");
        }
        Ok(applied)
    }

    /// Return orphaned RUNNING jobs to PENDING (or FAILED at the attempt limit).
    ///
    /// `attempts` is not touched; the next claim counts as a new attempt.
    pub async fn release_stale_jobs(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stale = self
            .store
            .query(&JobPredicate::stale(cutoff), JobOrder::OldestLock, self.config.stale_batch)
            .await?;

        let mut released = 0;
        for job in stale {
            let Some(lease) = job.lease() else {
                continue;
            };
            let expected = JobPredicate::stale(cutoff).with_locked_by(&lease.worker_id);
            let update = if job.attempts_exhausted() {
                JobUpdate::at(now)
                    .status(JobStatus::Failed)
                    .lock(LockChange::Release)
                    .last_error("lock expired on final attempt")
                    .finished()
            } else {
                JobUpdate::at(now)
                    .status(JobStatus::Pending)
                    .lock(LockChange::Release)
                    .available_at(now)
            };

            if self.store.conditional_update(job.id, &expected, &update).await? {
                released += 1;
                warn!(
                    job_id = %job.id,
                    worker_id = %lease.worker_id,
                    locked_at = %lease.locked_at,
                    attempts = job.attempts,
                    exhausted = job.attempts_exhausted(),
                    "released stale job"
                );
            }
        }

        if released > 0 {
            info!(released, "stale job sweep finished");
        }
        Ok(released)
    }

    /// Holder-checked progress note for observers. Never read by scheduling.
    pub async fn report_progress(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        stage: &str,
        detail: Option<String>,
    ) -> Result<bool, QueueError> {
        let update = JobUpdate::at(self.clock.now()).progress(stage, detail);
        let applied = self
            .store
            .conditional_update(job_id, &JobPredicate::held_by(worker_id), &update)
            .await?;
        Ok(applied)
    }

    pub async fn status(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(job_id).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        Ok(self.store.stats().await?)
    }
}
