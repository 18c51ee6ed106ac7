//! Lease store: durable job rows mutated only through conditional updates.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use opforge_core::{JobId, ResultRef, WorkerId};

use super::types::{Job, JobStats, JobStatus};

/// Row filter used both as the `WHERE` of a conditional update and as a query filter.
///
/// Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPredicate {
    pub status: Option<JobStatus>,
    /// `available_at <= t`
    pub available_by: Option<DateTime<Utc>>,
    pub locked_by: Option<WorkerId>,
    /// `locked_at < t`
    pub locked_before: Option<DateTime<Utc>>,
}

impl JobPredicate {
    pub fn any() -> Self {
        Self::default()
    }

    /// Pending and due at `now`.
    pub fn claimable(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            available_by: Some(now),
            ..Default::default()
        }
    }

    /// Running under `worker_id`'s lease.
    pub fn held_by(worker_id: &WorkerId) -> Self {
        Self {
            status: Some(JobStatus::Running),
            locked_by: Some(worker_id.clone()),
            ..Default::default()
        }
    }

    /// Running with a lock taken before `cutoff`.
    pub fn stale(cutoff: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Running),
            locked_before: Some(cutoff),
            ..Default::default()
        }
    }

    pub fn with_locked_by(mut self, worker_id: &WorkerId) -> Self {
        self.locked_by = Some(worker_id.clone());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.available_by.map_or(true, |t| job.available_at <= t)
            && self
                .locked_by
                .as_ref()
                .map_or(true, |w| job.locked_by.as_ref() == Some(w))
            && self
                .locked_before
                .map_or(true, |t| job.locked_at.is_some_and(|at| at < t))
    }
}

/// Change to the lease columns. Keeps `locked_at`/`locked_by` both set or both null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockChange {
    Acquire {
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },
    Refresh {
        at: DateTime<Utc>,
    },
    Release,
}

/// Fields written by a conditional update. `None` leaves a column untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub lock: Option<LockChange>,
    pub increment_attempts: bool,
    pub available_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub outcome: Option<Value>,
    pub result_ref: Option<ResultRef>,
    /// `(stage, detail)`; detail is overwritten together with the stage.
    pub progress: Option<(String, Option<String>)>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobUpdate {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            status: None,
            lock: None,
            increment_attempts: false,
            available_at: None,
            last_error: None,
            outcome: None,
            result_ref: None,
            progress: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn lock(mut self, change: LockChange) -> Self {
        self.lock = Some(change);
        self
    }

    pub fn increment_attempts(mut self) -> Self {
        self.increment_attempts = true;
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn outcome(mut self, outcome: Value) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn result_ref(mut self, result_ref: ResultRef) -> Self {
        self.result_ref = Some(result_ref);
        self
    }

    pub fn progress(mut self, stage: impl Into<String>, detail: Option<String>) -> Self {
        self.progress = Some((stage.into(), detail));
        self
    }

    pub fn finished(mut self) -> Self {
        self.finished_at = Some(self.updated_at);
        self
    }

    /// Apply to an in-memory row.
    pub fn apply(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        match &self.lock {
            Some(LockChange::Acquire { worker_id, at }) => {
                job.locked_by = Some(worker_id.clone());
                job.locked_at = Some(*at);
            }
            Some(LockChange::Refresh { at }) => {
                if job.locked_by.is_some() {
                    job.locked_at = Some(*at);
                }
            }
            Some(LockChange::Release) => {
                job.locked_by = None;
                job.locked_at = None;
            }
            None => {}
        }
        if self.increment_attempts {
            job.attempts += 1;
        }
        if let Some(at) = self.available_at {
            job.available_at = at;
        }
        if let Some(error) = &self.last_error {
            job.last_error = Some(error.clone());
        }
        if let Some(outcome) = &self.outcome {
            job.outcome = Some(outcome.clone());
        }
        if let Some(result_ref) = self.result_ref {
            job.result_ref = Some(result_ref);
        }
        if let Some((stage, detail)) = &self.progress {
            job.progress_stage = Some(stage.clone());
            job.progress_detail = detail.clone();
        }
        if let Some(at) = self.finished_at {
            job.finished_at = Some(at);
        }
        job.updated_at = self.updated_at;
    }
}

/// Result ordering for [`LeaseStore::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobOrder {
    /// `available_at`, then `created_at`, then id.
    #[default]
    OldestAvailable,
    /// `locked_at`, then id.
    OldestLock,
}

/// Lease store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable job storage. Every mutation goes through [`LeaseStore::conditional_update`].
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<(), LeaseStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, LeaseStoreError>;

    /// Apply `update` only if the row still matches `expected` at write time.
    ///
    /// Returns whether a row was changed. The check and the write are one atomic step.
    async fn conditional_update(
        &self,
        job_id: JobId,
        expected: &JobPredicate,
        update: &JobUpdate,
    ) -> Result<bool, LeaseStoreError>;

    async fn query(
        &self,
        filter: &JobPredicate,
        order: JobOrder,
        limit: usize,
    ) -> Result<Vec<Job>, LeaseStoreError>;

    async fn stats(&self) -> Result<JobStats, LeaseStoreError>;
}

#[async_trait]
impl<S> LeaseStore for Arc<S>
where
    S: LeaseStore + ?Sized,
{
    async fn insert(&self, job: Job) -> Result<(), LeaseStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, LeaseStoreError> {
        (**self).get(job_id).await
    }

    async fn conditional_update(
        &self,
        job_id: JobId,
        expected: &JobPredicate,
        update: &JobUpdate,
    ) -> Result<bool, LeaseStoreError> {
        (**self).conditional_update(job_id, expected, update).await
    }

    async fn query(
        &self,
        filter: &JobPredicate,
        order: JobOrder,
        limit: usize,
    ) -> Result<Vec<Job>, LeaseStoreError> {
        (**self).query(filter, order, limit).await
    }

    async fn stats(&self) -> Result<JobStats, LeaseStoreError> {
        (**self).stats().await
    }
}

/// In-memory lease store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn insert(&self, job: Job) -> Result<(), LeaseStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(LeaseStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, LeaseStoreError> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    async fn conditional_update(
        &self,
        job_id: JobId,
        expected: &JobPredicate,
        update: &JobUpdate,
    ) -> Result<bool, LeaseStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job) if expected.matches(job) => {
                update.apply(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn query(
        &self,
        filter: &JobPredicate,
        order: JobOrder,
        limit: usize,
    ) -> Result<Vec<Job>, LeaseStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();

        match order {
            JobOrder::OldestAvailable => {
                result.sort_by_key(|j| (j.available_at, j.created_at, j.id));
            }
            JobOrder::OldestLock => {
                result.sort_by_key(|j| (j.locked_at, j.id));
            }
        }
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<JobStats, LeaseStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::jobs::types::JobParams;

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name).unwrap()
    }

    #[test]
    fn predicate_matches_every_set_field() {
        let now = Utc::now();
        let mut job = Job::new(JobParams::new(), 3, now);

        assert!(JobPredicate::any().matches(&job));
        assert!(JobPredicate::claimable(now).matches(&job));
        assert!(!JobPredicate::claimable(now - Duration::seconds(1)).matches(&job));
        assert!(!JobPredicate::stale(now).matches(&job));

        let w = worker("w-1");
        JobUpdate::at(now)
            .status(JobStatus::Running)
            .lock(LockChange::Acquire {
                worker_id: w.clone(),
                at: now,
            })
            .apply(&mut job);

        assert!(JobPredicate::held_by(&w).matches(&job));
        assert!(!JobPredicate::held_by(&worker("w-2")).matches(&job));
        assert!(JobPredicate::stale(now + Duration::seconds(1)).matches(&job));
        assert!(!JobPredicate::stale(now).matches(&job));
    }

    #[test]
    fn lock_changes_keep_fields_paired() {
        let now = Utc::now();
        let mut job = Job::new(JobParams::new(), 3, now);

        JobUpdate::at(now)
            .lock(LockChange::Refresh { at: now })
            .apply(&mut job);
        assert!(job.locked_at.is_none() && job.locked_by.is_none());

        JobUpdate::at(now)
            .lock(LockChange::Acquire {
                worker_id: worker("w-1"),
                at: now,
            })
            .apply(&mut job);
        assert!(job.lease().is_some());

        JobUpdate::at(now).lock(LockChange::Release).apply(&mut job);
        assert!(job.locked_at.is_none() && job.locked_by.is_none());
    }

    #[tokio::test]
    async fn conditional_update_applies_only_on_match() {
        let store = InMemoryLeaseStore::new();
        let now = Utc::now();
        let job = Job::new(JobParams::new(), 3, now);
        let id = job.id;
        store.insert(job.clone()).await.unwrap();
        assert!(matches!(
            store.insert(job).await,
            Err(LeaseStoreError::AlreadyExists(_))
        ));

        let update = JobUpdate::at(now).status(JobStatus::Running).increment_attempts();
        assert!(store
            .conditional_update(id, &JobPredicate::claimable(now), &update)
            .await
            .unwrap());
        // Second identical write sees RUNNING and does nothing.
        assert!(!store
            .conditional_update(id, &JobPredicate::claimable(now), &update)
            .await
            .unwrap());
        assert_eq!(store.get(id).await.unwrap().unwrap().attempts, 1);

        assert!(!store
            .conditional_update(JobId::new(), &JobPredicate::any(), &update)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn query_orders_oldest_available_first() {
        let store = InMemoryLeaseStore::new();
        let now = Utc::now();
        let late = Job::new(JobParams::new(), 3, now);
        let early = Job::new(JobParams::new(), 3, now - Duration::minutes(5));
        store.insert(late.clone()).await.unwrap();
        store.insert(early.clone()).await.unwrap();

        let rows = store
            .query(&JobPredicate::claimable(now), JobOrder::OldestAvailable, 10)
            .await
            .unwrap();
        let ids: Vec<JobId> = rows.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);

        let limited = store
            .query(&JobPredicate::any(), JobOrder::OldestAvailable, 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.total(), 2);
    }
}
