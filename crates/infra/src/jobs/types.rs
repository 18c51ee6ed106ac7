//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use opforge_ai::SynthesisMode;
use opforge_core::{DomainError, DomainResult, JobId, ResultRef, TargetId, WorkerId};

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, claimable once `available_at` has passed
    Pending,
    /// Leased by a worker
    Running,
    Succeeded,
    /// Exhausted retries
    Failed,
    /// Blocked by the evidence gate; never retried
    InsufficientEvidence,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::InsufficientEvidence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::InsufficientEvidence => "insufficient_evidence",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::InsufficientEvidence
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Opaque key/value payload supplied by the enqueuing application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParams(Map<String, Value>);

impl JobParams {
    pub const TARGET_ID: &'static str = "target_id";
    pub const MODE: &'static str = "mode";

    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Params for a synthesis run over `target_id`.
    pub fn synthesis(target_id: TargetId, mode: SynthesisMode) -> Self {
        Self::new()
            .with(Self::TARGET_ID, target_id.to_string())
            .with(Self::MODE, mode.as_str())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn target_id(&self) -> DomainResult<TargetId> {
        let raw = self
            .get(Self::TARGET_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| DomainError::missing(Self::TARGET_ID))?;
        raw.parse()
    }

    /// Missing mode means standard.
    pub fn mode(&self) -> DomainResult<SynthesisMode> {
        match self.get(Self::MODE) {
            None | Some(Value::Null) => Ok(SynthesisMode::default()),
            Some(Value::String(s)) => s.parse(),
            Some(other) => Err(DomainError::validation(format!(
                "mode must be a string, got {other}"
            ))),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn from_value(value: Value) -> DomainResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DomainError::validation(format!(
                "job params must be a JSON object, got {other}"
            ))),
        }
    }
}

/// The `(locked_at, locked_by)` pair held by a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: WorkerId,
    pub locked_at: DateTime<Utc>,
}

/// A durable job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<WorkerId>,
    /// Earliest time the job may be claimed.
    pub available_at: DateTime<Utc>,
    pub params: JobParams,
    pub last_error: Option<String>,
    /// Structured terminal detail (run summary, gate report, or failure category).
    pub outcome: Option<Value>,
    pub result_ref: Option<ResultRef>,
    pub progress_stage: Option<String>,
    pub progress_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(params: JobParams, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            locked_at: None,
            locked_by: None,
            available_at: now,
            params,
            last_error: None,
            outcome: None,
            result_ref: None,
            progress_stage: None,
            progress_detail: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn lease(&self) -> Option<Lease> {
        match (&self.locked_by, self.locked_at) {
            (Some(worker_id), Some(locked_at)) => Some(Lease {
                worker_id: worker_id.clone(),
                locked_at,
            }),
            _ => None,
        }
    }

    pub fn is_held_by(&self, worker_id: &WorkerId) -> bool {
        self.status == JobStatus::Running && self.locked_by.as_ref() == Some(worker_id)
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.available_at <= now
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Retry backoff: `base * 2^attempts`, optionally capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// `None` = uncapped.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next claim after `attempts` failed attempts.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let multiplier = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    pub fn next_available_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempts))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub insufficient_evidence: usize,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::InsufficientEvidence => self.insufficient_evidence += count,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.insufficient_evidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_from_thirty_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(240));
    }

    #[test]
    fn backoff_respects_ceiling_and_never_overflows() {
        let capped = RetryPolicy {
            max_delay: Some(Duration::from_secs(100)),
            ..Default::default()
        };
        assert_eq!(capped.delay_for_attempt(2), Duration::from_secs(100));

        let uncapped = RetryPolicy::default();
        assert_eq!(
            uncapped.delay_for_attempt(64),
            Duration::from_secs(30) * u32::MAX
        );
        let now = Utc::now();
        assert!(uncapped.next_available_at(64, now) > now);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
        assert!(JobStatus::InsufficientEvidence.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn params_expose_target_and_mode() {
        let target = TargetId::new();
        let params = JobParams::synthesis(target, SynthesisMode::Deep);
        assert_eq!(params.target_id().unwrap(), target);
        assert_eq!(params.mode().unwrap(), SynthesisMode::Deep);

        let bare = JobParams::new().with(JobParams::TARGET_ID, target.to_string());
        assert_eq!(bare.mode().unwrap(), SynthesisMode::Standard);
    }

    #[test]
    fn params_reject_missing_or_malformed_fields() {
        assert!(JobParams::new().target_id().is_err());
        assert!(JobParams::new().with("target_id", 42).target_id().is_err());
        assert!(JobParams::new().with("mode", "turbo").mode().is_err());
        assert!(JobParams::from_value(serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn new_job_is_pending_and_immediately_claimable() {
        let now = Utc::now();
        let job = Job::new(JobParams::new(), 3, now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.lease().is_none());
        assert!(job.is_claimable(now));
        assert!(!job.is_claimable(now - chrono::Duration::seconds(1)));
    }
}
