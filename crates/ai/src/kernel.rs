//! Kernels: cheap per-evidence judgments, and their consolidation into the
//! set that gets expanded.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::similarity::{dedupe_by_title, DEFAULT_SIMILARITY_THRESHOLD};

/// An atomic candidate judgment produced from one evidence group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    /// Position of the source evidence group; stable tie-breaker.
    pub index: usize,
    pub title: String,
    pub angle: String,
    /// Model-reported confidence, clamped to `[0, 1]`.
    pub confidence: f64,
    pub source_urls: Vec<String>,
}

impl Kernel {
    pub fn is_valid(&self) -> bool {
        !self.title.trim().is_empty() && self.confidence.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationPolicy {
    pub min_expansions: usize,
    pub max_expansions: usize,
    pub similarity_threshold: f64,
}

impl Default for ConsolidationPolicy {
    fn default() -> Self {
        Self {
            min_expansions: 3,
            max_expansions: 8,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Consolidation {
    /// Ranked best-first; at most `max_expansions`.
    pub selected: Vec<Kernel>,
    pub invalid_removed: usize,
    pub duplicates_removed: usize,
    /// Fewer than `min_expansions` kernels survived.
    pub shortfall: bool,
}

/// Dedupe, rank (confidence desc, then index) and truncate kernels.
pub fn consolidate(kernels: Vec<Kernel>, policy: &ConsolidationPolicy) -> Consolidation {
    let before = kernels.len();
    let mut valid: Vec<Kernel> = kernels.into_iter().filter(Kernel::is_valid).collect();
    let invalid_removed = before - valid.len();

    valid.sort_by_key(|k| k.index);
    let (mut unique, duplicates_removed) = dedupe_by_title(
        valid,
        policy.similarity_threshold,
        |k| k.title.as_str(),
        |k| k.confidence,
    );

    unique.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
    unique.truncate(policy.max_expansions);

    Consolidation {
        shortfall: unique.len() < policy.min_expansions,
        selected: unique,
        invalid_removed,
        duplicates_removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(index: usize, title: &str, confidence: f64) -> Kernel {
        Kernel {
            index,
            title: title.to_string(),
            angle: "angle".to_string(),
            confidence,
            source_urls: vec![format!("https://example.com/{index}")],
        }
    }

    #[test]
    fn ranks_by_confidence_then_index() {
        let kernels = vec![
            kernel(0, "Pricing pages confuse buyers", 0.5),
            kernel(1, "Founders hate cold outreach", 0.9),
            kernel(2, "Support tickets reveal churn", 0.5),
        ];
        let out = consolidate(kernels, &ConsolidationPolicy::default());

        let order: Vec<usize> = out.selected.iter().map(|k| k.index).collect();
        assert_eq!(order, vec![1, 0, 2]);
        assert!(!out.shortfall);
    }

    #[test]
    fn drops_invalid_and_near_duplicate_kernels() {
        let kernels = vec![
            kernel(0, "Founders hate cold outreach", 0.6),
            kernel(1, "  ", 0.99),
            kernel(2, "founders HATE cold outreach", 0.8),
            kernel(3, "Churn hides in support tickets", f64::NAN),
        ];
        let out = consolidate(kernels, &ConsolidationPolicy::default());

        assert_eq!(out.invalid_removed, 2);
        assert_eq!(out.duplicates_removed, 1);
        assert_eq!(out.selected.len(), 1);
        assert_eq!(out.selected[0].index, 2);
        assert!(out.shortfall);
    }

    #[test]
    fn truncates_to_max_expansions() {
        let kernels = (0..12)
            .map(|i| kernel(i, &format!("distinct topic number {i}"), i as f64 / 12.0))
            .collect();
        let policy = ConsolidationPolicy {
            max_expansions: 4,
            ..Default::default()
        };
        let out = consolidate(kernels, &policy);

        let order: Vec<usize> = out.selected.iter().map(|k| k.index).collect();
        assert_eq!(order, vec![11, 10, 9, 8]);
    }
}
