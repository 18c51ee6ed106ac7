//! Runtime configuration.
//!
//! Plain structs resolved once at process start (the worker binary builds them
//! from flags and environment) and passed into constructors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use opforge_ai::{ConsolidationPolicy, GatePolicy, ValidationRules, DEFAULT_SIMILARITY_THRESHOLD};

use crate::jobs::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    /// A RUNNING job whose lock is older than this is considered orphaned.
    pub stale_threshold: Duration,
    /// Rows considered per claim attempt before giving up for this poll.
    pub claim_candidates: usize,
    /// Upper bound on rows touched by one stale sweep.
    pub stale_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry: RetryPolicy::default(),
            stale_threshold: Duration::from_secs(10 * 60),
            claim_candidates: 8,
            stale_batch: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// How long to wait for the heartbeat task to exit after stop.
    pub grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub kernel_deadline: Duration,
    pub expansion_deadline: Duration,
    /// Bound on in-flight synthesis calls per stage.
    pub max_concurrency: usize,
    /// Evidence records grouped into one kernel prompt.
    pub evidence_per_kernel: usize,
    pub min_expansions: usize,
    pub max_expansions: usize,
    pub min_ready_items: usize,
    /// Below this after a full wait, the run is degraded.
    pub target_ready_items: usize,
    /// Stop waiting on expansions once `min_ready_items` succeeded.
    pub stop_at_min_ready: bool,
    pub similarity_threshold: f64,
    pub validation: ValidationRules,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            kernel_deadline: Duration::from_secs(8),
            expansion_deadline: Duration::from_secs(20),
            max_concurrency: 4,
            evidence_per_kernel: 3,
            min_expansions: 3,
            max_expansions: 8,
            min_ready_items: 3,
            target_ready_items: 3,
            stop_at_min_ready: true,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            validation: ValidationRules::default(),
        }
    }
}

impl PipelineConfig {
    pub fn consolidation(&self) -> ConsolidationPolicy {
        ConsolidationPolicy {
            min_expansions: self.min_expansions,
            max_expansions: self.max_expansions,
            similarity_threshold: self.similarity_threshold,
        }
    }
}

/// OpenAI-compatible chat completions endpoint used for synthesis calls.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisEndpointConfig {
    /// Base URL without the `/chat/completions` suffix.
    pub base_url: String,
    pub api_key: Option<String>,
    pub fast_model: String,
    pub heavy_model: String,
    pub max_output_tokens: u32,
}

impl Default for SynthesisEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            fast_model: "gpt-4o-mini".to_string(),
            heavy_model: "gpt-4o".to_string(),
            max_output_tokens: 1_500,
        }
    }
}

impl std::fmt::Debug for SynthesisEndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisEndpointConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("fast_model", &self.fast_model)
            .field("heavy_model", &self.heavy_model)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}

/// Everything below the binary, in one place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub heartbeat: HeartbeatConfig,
    pub pipeline: PipelineConfig,
    pub gate: GatePolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.retry.base_delay, Duration::from_secs(30));
        assert_eq!(config.queue.stale_threshold, Duration::from_secs(600));
        assert_eq!(config.heartbeat.interval, Duration::from_secs(30));
        assert_eq!(config.pipeline.expansion_deadline, Duration::from_secs(20));
        assert_eq!(config.pipeline.min_ready_items, 3);
        assert!(config.pipeline.stop_at_min_ready);

        let consolidation = config.pipeline.consolidation();
        assert_eq!(consolidation.max_expansions, 8);
    }

    #[test]
    fn endpoint_debug_hides_the_api_key() {
        let endpoint = SynthesisEndpointConfig {
            api_key: Some("sk-secret".into()),
            ..Default::default()
        };
        let rendered = format!("{:?}", endpoint);
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
