//! External collaborators of the synthesis pipeline.
//!
//! The runner only sees these traits; Postgres and HTTP implementations live in
//! `db` and `external`, in-memory ones here for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use opforge_ai::{
    ErrorCategory, EvidenceRecord, EvidenceSet, OutputError, PipelineResult, Prompt, SynthesisMode,
};
use opforge_core::{JobId, ResultRef, TargetId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvidenceError {
    #[error("evidence source rejected credentials: {0}")]
    Unauthorized(String),
    #[error("evidence source rate limited: {0}")]
    RateLimited(String),
    #[error("evidence source unavailable: {0}")]
    Unavailable(String),
    #[error("malformed evidence: {0}")]
    Malformed(String),
}

impl EvidenceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EvidenceError::Unauthorized(_) => ErrorCategory::Auth,
            EvidenceError::RateLimited(_) => ErrorCategory::RateLimited,
            EvidenceError::Unavailable(_) | EvidenceError::Malformed(_) => ErrorCategory::Unknown,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("provider rejected credentials: {0}")]
    Auth(String),
    #[error("provider quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("provider rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("synthesis call timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider error ({status}): {message}")]
    Provider { status: u16, message: String },
    #[error(transparent)]
    InvalidOutput(#[from] OutputError),
}

impl SynthesisError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SynthesisError::Auth(_) => ErrorCategory::Auth,
            SynthesisError::QuotaExhausted(_) => ErrorCategory::QuotaExhausted,
            SynthesisError::RateLimited { .. } => ErrorCategory::RateLimited,
            SynthesisError::Timeout => ErrorCategory::Timeout,
            SynthesisError::Transport(_)
            | SynthesisError::Provider { .. }
            | SynthesisError::InvalidOutput(_) => ErrorCategory::Unknown,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("result serialization failed: {0}")]
    Serialization(String),
    #[error("result storage failed: {0}")]
    Storage(String),
}

/// Fetches the evidence a synthesis run works from. No retries here.
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    async fn fetch_evidence(
        &self,
        target_id: TargetId,
        mode: SynthesisMode,
    ) -> Result<EvidenceSet, EvidenceError>;
}

/// One model call. `deadline` is advisory for the callee; the runner races
/// every call against its own timer.
#[async_trait]
pub trait SynthesisClient: Send + Sync {
    async fn call(&self, prompt: Prompt, deadline: Duration) -> Result<String, SynthesisError>;
}

/// Persists a finished run and returns an opaque reference to it.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn commit(&self, job_id: JobId, result: &PipelineResult) -> Result<ResultRef, SinkError>;
}

/// Stage-level progress notes for observers. Implementations swallow their own errors.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, stage: &str, detail: Option<String>);
}

/// Progress sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _stage: &str, _detail: Option<String>) {}
}

/// In-memory evidence keyed by target, for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryEvidenceSource {
    inner: Mutex<HashMap<TargetId, Result<Vec<EvidenceRecord>, EvidenceError>>>,
}

impl InMemoryEvidenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, target_id: TargetId, records: Vec<EvidenceRecord>) {
        self.inner.lock().unwrap().insert(target_id, Ok(records));
    }

    pub fn fail_with(&self, target_id: TargetId, error: EvidenceError) {
        self.inner.lock().unwrap().insert(target_id, Err(error));
    }
}

#[async_trait]
impl EvidenceSource for InMemoryEvidenceSource {
    async fn fetch_evidence(
        &self,
        target_id: TargetId,
        _mode: SynthesisMode,
    ) -> Result<EvidenceSet, EvidenceError> {
        let records = self
            .inner
            .lock()
            .unwrap()
            .get(&target_id)
            .cloned()
            .unwrap_or(Ok(Vec::new()))?;
        Ok(EvidenceSet::new(target_id, records))
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryResultSink {
    inner: Mutex<Vec<(JobId, ResultRef, PipelineResult)>>,
}

impl InMemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn all(&self) -> Vec<(JobId, ResultRef, PipelineResult)> {
        self.inner.lock().unwrap().clone()
    }

    pub fn for_job(&self, job_id: JobId) -> Option<PipelineResult> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _, _)| *id == job_id)
            .map(|(_, _, result)| result.clone())
    }
}

#[async_trait]
impl ResultSink for InMemoryResultSink {
    async fn commit(&self, job_id: JobId, result: &PipelineResult) -> Result<ResultRef, SinkError> {
        let result_ref = ResultRef::new();
        self.inner
            .lock()
            .unwrap()
            .push((job_id, result_ref, result.clone()));
        Ok(result_ref)
    }
}
