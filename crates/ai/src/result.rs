use serde::{Deserialize, Serialize};

use opforge_core::TargetId;

use crate::evidence::EvidenceStats;
use crate::scoring::Candidate;

/// How a single fan-out task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Timeout,
    Failure,
}

/// Per-stage fan-out counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub attempted: usize,
    pub succeeded: usize,
    pub timed_out: usize,
    pub failed: usize,
    /// Still in flight when the stage stopped waiting.
    pub abandoned: usize,
}

impl StageCounts {
    pub fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Success => self.succeeded += 1,
            TaskOutcome::Timeout => self.timed_out += 1,
            TaskOutcome::Failure => self.failed += 1,
        }
    }

    pub fn resolved(&self) -> usize {
        self.succeeded + self.timed_out + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutStats {
    pub kernels: StageCounts,
    pub expansions: StageCounts,
    /// Fewer kernels survived consolidation than the configured minimum.
    pub kernel_shortfall: bool,
    pub invalid_removed: usize,
    pub duplicates_removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DegradedReason {
    /// Every task resolved and fewer than the minimum succeeded.
    BelowMinimum { ready: usize, minimum: usize },
    /// The run waited for every task and still missed the target count.
    BelowTarget { ready: usize, target: usize },
}

/// Post-gate quality of a committed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "quality")]
pub enum RunQuality {
    Complete,
    Degraded { reason: DegradedReason },
}

impl RunQuality {
    /// Classify a run from its expansion counts.
    ///
    /// `waited_for_all` is false when the runner stopped at `minimum`
    /// successes and abandoned the rest.
    pub fn classify(ready: usize, minimum: usize, target: usize, waited_for_all: bool) -> Self {
        if ready < minimum {
            RunQuality::Degraded {
                reason: DegradedReason::BelowMinimum { ready, minimum },
            }
        } else if waited_for_all && ready < target {
            RunQuality::Degraded {
                reason: DegradedReason::BelowTarget { ready, target },
            }
        } else {
            RunQuality::Complete
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, RunQuality::Degraded { .. })
    }

    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            RunQuality::Complete => None,
            RunQuality::Degraded { .. } => {
                Some("generation fell short of the usual output; retry the run")
            }
        }
    }
}

/// Aggregate output of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub target_id: TargetId,
    /// Score-sorted, validated, deduplicated items.
    pub items: Vec<Candidate>,
    pub evidence: EvidenceStats,
    pub stats: FanoutStats,
    pub quality: RunQuality,
    pub stopped_early: bool,
    pub elapsed_ms: u64,
}

impl PipelineResult {
    /// Compact summary stored on the job row.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "committed",
            "items": self.items.len(),
            "quality": self.quality,
            "remediation": self.quality.remediation(),
            "stopped_early": self.stopped_early,
            "kernels": self.stats.kernels,
            "expansions": self.stats.expansions,
            "elapsed_ms": self.elapsed_ms,
        })
    }
}

/// Operator-facing classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    QuotaExhausted,
    RateLimited,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn remediation_hint(&self) -> &'static str {
        match self {
            ErrorCategory::Auth => "reconnect the account or refresh the provider credentials",
            ErrorCategory::QuotaExhausted => "the usage budget is exhausted; raise the limit or wait for the next cycle",
            ErrorCategory::RateLimited => "the provider is rate limiting; the job will retry automatically",
            ErrorCategory::Timeout => "the provider did not answer in time; retry later",
            ErrorCategory::Unknown => "unexpected error; retry, and contact support if it persists",
        }
    }
}

/// Structured failure detail stored with a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub category: ErrorCategory,
    pub message: String,
    pub hint: String,
}

impl FailureDetail {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            hint: category.remediation_hint().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_record_each_outcome() {
        let mut counts = StageCounts {
            attempted: 4,
            ..Default::default()
        };
        for outcome in [
            TaskOutcome::Success,
            TaskOutcome::Timeout,
            TaskOutcome::Failure,
            TaskOutcome::Success,
        ] {
            counts.record(outcome);
        }
        assert_eq!(counts.succeeded, 2);
        assert_eq!(counts.resolved(), 4);
    }

    #[test]
    fn early_stop_at_minimum_is_complete() {
        assert_eq!(RunQuality::classify(3, 3, 5, false), RunQuality::Complete);
    }

    #[test]
    fn full_wait_below_target_is_degraded() {
        assert_eq!(
            RunQuality::classify(3, 3, 5, true),
            RunQuality::Degraded {
                reason: DegradedReason::BelowTarget { ready: 3, target: 5 }
            }
        );
        assert_eq!(RunQuality::classify(5, 3, 5, true), RunQuality::Complete);
    }

    #[test]
    fn below_minimum_is_degraded_regardless_of_wait() {
        let q = RunQuality::classify(2, 3, 3, true);
        assert!(q.is_degraded());
        assert!(q.remediation().unwrap().contains("retry"));
    }

    #[test]
    fn quality_serializes_with_tagged_reason() {
        let json = serde_json::to_value(RunQuality::Degraded {
            reason: DegradedReason::BelowMinimum { ready: 1, minimum: 3 },
        })
        .unwrap();
        assert_eq!(json["quality"], "degraded");
        assert_eq!(json["reason"]["kind"], "below_minimum");
        assert_eq!(json["reason"]["ready"], 1);
    }

    #[test]
    fn failure_detail_carries_hint() {
        let detail = FailureDetail::new(ErrorCategory::Auth, "401 from provider");
        assert!(detail.hint.contains("reconnect"));
    }
}
