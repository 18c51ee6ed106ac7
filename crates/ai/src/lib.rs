//! `opforge-ai`
//!
//! **Responsibility:** the deterministic half of the synthesis pipeline.
//!
//! Everything here is pure: no I/O, no clocks read internally, no async.
//! - Evidence model and coverage statistics
//! - Gate policy (hard block before any paid synthesis call)
//! - Kernel consolidation and expansion scoring/deduplication
//! - Prompt construction and model output parsing
//!
//! Orchestration (fan-out, deadlines, persistence) lives in `opforge-infra`.

pub mod evidence;
pub mod gate;
pub mod kernel;
pub mod mode;
pub mod prompt;
pub mod result;
pub mod scoring;
pub mod similarity;

pub use evidence::{Engagement, EvidenceRecord, EvidenceSet, EvidenceStats, Platform};
pub use gate::{GateCheck, GateKind, GatePolicy, GateReport, QualityGate, Shortfall, UsabilityGate};
pub use kernel::{consolidate, Consolidation, ConsolidationPolicy, Kernel};
pub use mode::SynthesisMode;
pub use prompt::{ModelTier, OutputError, Prompt};
pub use result::{
    DegradedReason, ErrorCategory, FailureDetail, FanoutStats, PipelineResult, RunQuality,
    StageCounts, TaskOutcome,
};
pub use scoring::{finalize, Candidate, ExpansionDraft, Finalized, ValidationRules};
pub use similarity::{dedupe_by_title, jaccard, title_similarity, DEFAULT_SIMILARITY_THRESHOLD};
