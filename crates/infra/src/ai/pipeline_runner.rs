//! Synthesis pipeline runner.
//!
//! Stages run in order: evidence, gate, kernels, consolidation, expansion,
//! scoring, commit. The gate is a hard block taken before any synthesis spend.
//! Kernel and expansion calls fan out with per-task deadlines; a task's
//! failure is counted and absorbed, never propagated.

use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use opforge_ai::prompt::{expansion_prompt, kernel_prompt, parse_expansion, parse_kernel};
use opforge_ai::{
    consolidate, finalize, Candidate, ErrorCategory, EvidenceSet, FailureDetail, FanoutStats,
    GatePolicy, GateReport, Kernel, PipelineResult, RunQuality, SynthesisMode,
};
use opforge_core::{Clock, DomainError, JobId, ResultRef, TargetId};

use crate::config::PipelineConfig;
use crate::jobs::JobParams;

use super::collaborators::{
    EvidenceError, EvidenceSource, ProgressSink, ResultSink, SinkError, SynthesisClient,
    SynthesisError,
};
use super::fanout::{fan_out, fan_out_until, FanoutPolicy, FanoutRun};

/// Pipeline failure outside the fan-out stages. Always retryable via the queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid job params: {0}")]
    InvalidParams(#[from] DomainError),
    #[error("evidence acquisition failed: {0}")]
    Evidence(#[from] EvidenceError),
    #[error("result commit failed: {0}")]
    Commit(#[from] SinkError),
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::InvalidParams(_) => ErrorCategory::Unknown,
            PipelineError::Evidence(err) => err.category(),
            PipelineError::Commit(_) => ErrorCategory::Unknown,
        }
    }

    pub fn detail(&self) -> FailureDetail {
        FailureDetail::new(self.category(), self.to_string())
    }
}

/// Result of one stage.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Proceed(T),
    /// Policy-terminal: the evidence gate refused.
    Blocked(GateReport),
    Failed(PipelineError),
}

/// Result of a whole run.
#[derive(Debug)]
pub enum RunOutcome {
    Committed {
        result_ref: ResultRef,
        result: PipelineResult,
    },
    InsufficientEvidence(GateReport),
    Failed(PipelineError),
}

macro_rules! proceed {
    ($stage:expr) => {
        match $stage {
            StageOutcome::Proceed(value) => value,
            StageOutcome::Blocked(report) => return RunOutcome::InsufficientEvidence(report),
            StageOutcome::Failed(err) => return RunOutcome::Failed(err),
        }
    };
}

pub struct PipelineRunner {
    evidence: Arc<dyn EvidenceSource>,
    synthesis: Arc<dyn SynthesisClient>,
    sink: Arc<dyn ResultSink>,
    clock: Arc<dyn Clock>,
    gate: GatePolicy,
    config: PipelineConfig,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("gate", &self.gate)
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineRunner {
    pub fn new(
        evidence: Arc<dyn EvidenceSource>,
        synthesis: Arc<dyn SynthesisClient>,
        sink: Arc<dyn ResultSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            evidence,
            synthesis,
            sink,
            clock,
            gate: GatePolicy::default(),
            config: PipelineConfig::default(),
        }
    }

    pub fn with_gate(mut self, gate: GatePolicy) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self, job_id: JobId, params: &JobParams, progress: &dyn ProgressSink) -> RunOutcome {
        let started = Instant::now();
        let (target_id, mode) = proceed!(Self::read_params(params));

        progress.report("evidence", None).await;
        let evidence = proceed!(self.acquire_evidence(target_id, mode).await);

        progress.report("gate", Some(format!("{} items", evidence.len()))).await;
        let report = proceed!(self.check_gate(job_id, &evidence));

        progress.report("kernels", None).await;
        let kernels = self.generate_kernels(mode, &evidence).await;
        let kernel_counts = kernels.counts;
        let consolidation = consolidate(
            kernels.successes.into_iter().map(|(_, kernel)| kernel).collect(),
            &self.config.consolidation(),
        );
        if consolidation.shortfall {
            warn!(
                job_id = %job_id,
                selected = consolidation.selected.len(),
                min_expansions = self.config.min_expansions,
                "kernel shortfall"
            );
        }

        progress
            .report("expansion", Some(format!("{} kernels", consolidation.selected.len())))
            .await;
        let expansions = self.expand(mode, &consolidation.selected).await;

        progress.report("scoring", None).await;
        let finalized = finalize(
            expansions.successes.into_iter().map(|(_, c)| c).collect(),
            &self.config.validation,
            self.config.similarity_threshold,
        );
        let quality = RunQuality::classify(
            finalized.items.len(),
            self.config.min_ready_items,
            self.config.target_ready_items,
            !expansions.stopped_early,
        );

        let result = PipelineResult {
            target_id,
            items: finalized.items,
            evidence: report.stats,
            stats: FanoutStats {
                kernels: kernel_counts,
                expansions: expansions.counts,
                kernel_shortfall: consolidation.shortfall,
                invalid_removed: consolidation.invalid_removed + finalized.invalid_removed,
                duplicates_removed: consolidation.duplicates_removed + finalized.duplicates_removed,
            },
            quality,
            stopped_early: expansions.stopped_early,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        progress.report("commit", Some(format!("{} items", result.items.len()))).await;
        let result_ref = proceed!(self.commit(job_id, &result).await);

        info!(
            job_id = %job_id,
            target_id = %target_id,
            items = result.items.len(),
            degraded = result.quality.is_degraded(),
            stopped_early = result.stopped_early,
            elapsed_ms = result.elapsed_ms,
            "pipeline committed"
        );
        RunOutcome::Committed { result_ref, result }
    }

    fn read_params(params: &JobParams) -> StageOutcome<(TargetId, SynthesisMode)> {
        match params.target_id().and_then(|t| params.mode().map(|m| (t, m))) {
            Ok(pair) => StageOutcome::Proceed(pair),
            Err(err) => StageOutcome::Failed(err.into()),
        }
    }

    async fn acquire_evidence(&self, target_id: TargetId, mode: SynthesisMode) -> StageOutcome<EvidenceSet> {
        match self.evidence.fetch_evidence(target_id, mode).await {
            Ok(set) => StageOutcome::Proceed(set),
            Err(err) => StageOutcome::Failed(err.into()),
        }
    }

    fn check_gate(&self, job_id: JobId, evidence: &EvidenceSet) -> StageOutcome<GateReport> {
        let report = self.gate.evaluate(evidence, self.clock.now());
        if report.passed {
            StageOutcome::Proceed(report)
        } else {
            info!(
                job_id = %job_id,
                failed_checks = report.shortfalls.len(),
                summary = %report.summary(),
                "evidence gate blocked run"
            );
            StageOutcome::Blocked(report)
        }
    }

    async fn generate_kernels(&self, mode: SynthesisMode, evidence: &EvidenceSet) -> FanoutRun<Kernel> {
        let deadline = self.config.kernel_deadline;
        let tasks: Vec<_> = evidence
            .records()
            .chunks(self.config.evidence_per_kernel.max(1))
            .enumerate()
            .map(|(index, group)| {
                let client = self.synthesis.clone();
                let prompt = kernel_prompt(mode, group);
                let sources: Vec<String> = group.iter().map(|r| r.canonical_url()).collect();
                async move {
                    let output = client.call(prompt, deadline).await?;
                    Ok::<_, SynthesisError>(parse_kernel(&output, index, sources)?)
                }
            })
            .collect();

        let run = fan_out(
            "kernels",
            tasks,
            FanoutPolicy {
                max_concurrency: self.config.max_concurrency,
                deadline,
                stop_after: None,
            },
        )
        .await;
        info!(
            attempted = run.counts.attempted,
            succeeded = run.counts.succeeded,
            timed_out = run.counts.timed_out,
            failed = run.counts.failed,
            "kernel generation finished"
        );
        run
    }

    async fn expand(&self, mode: SynthesisMode, kernels: &[Kernel]) -> FanoutRun<Candidate> {
        let deadline = self.config.expansion_deadline;
        let tasks: Vec<_> = kernels
            .iter()
            .enumerate()
            .map(|(rank, kernel)| {
                let client = self.synthesis.clone();
                let prompt = expansion_prompt(mode, kernel);
                let kernel = kernel.clone();
                async move {
                    let output = client.call(prompt, deadline).await?;
                    let draft = parse_expansion(&output)?;
                    Ok::<_, SynthesisError>(Candidate::from_draft(rank, &kernel, draft))
                }
            })
            .collect();

        let stop_after = self
            .config
            .stop_at_min_ready
            .then_some(self.config.min_ready_items);
        // Only candidates that survive validation and dedupe count toward the stop.
        let rules = &self.config.validation;
        let threshold = self.config.similarity_threshold;
        let run = fan_out_until(
            "expansion",
            tasks,
            FanoutPolicy {
                max_concurrency: self.config.max_concurrency,
                deadline,
                stop_after,
            },
            |successes: &[(usize, Candidate)]| {
                let candidates = successes.iter().map(|(_, c)| c.clone()).collect();
                finalize(candidates, rules, threshold).items.len()
            },
        )
        .await;
        info!(
            attempted = run.counts.attempted,
            succeeded = run.counts.succeeded,
            timed_out = run.counts.timed_out,
            failed = run.counts.failed,
            abandoned = run.counts.abandoned,
            stopped_early = run.stopped_early,
            "expansion finished"
        );
        run
    }

    async fn commit(&self, job_id: JobId, result: &PipelineResult) -> StageOutcome<ResultRef> {
        match self.sink.commit(job_id, result).await {
            Ok(result_ref) => StageOutcome::Proceed(result_ref),
            Err(err) => StageOutcome::Failed(err.into()),
        }
    }
}
