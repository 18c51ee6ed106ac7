//! Synthesis orchestration: the async half of the pipeline.
//!
//! Pure decisions (gate, consolidation, scoring) come from `opforge-ai`; this
//! module owns collaborators, deadlines and bounded fan-out.

pub mod collaborators;
pub mod fanout;
pub mod pipeline_runner;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use collaborators::{
    EvidenceError, EvidenceSource, InMemoryEvidenceSource, InMemoryResultSink, NoProgress,
    ProgressSink, ResultSink, SinkError, SynthesisClient, SynthesisError,
};
pub use fanout::{fan_out, fan_out_until, FanoutPolicy, FanoutRun};
pub use pipeline_runner::{PipelineError, PipelineRunner, RunOutcome, StageOutcome};
pub use registry::{AdapterLookup, AdapterRegistry, Capability, EvidenceAdapter, RegistryEvidenceSource};
