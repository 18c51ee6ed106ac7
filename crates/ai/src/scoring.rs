//! Post-expansion validation, scoring and ordering.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::kernel::Kernel;
use crate::similarity::dedupe_by_title;

/// Raw expansion payload as returned by the heavy model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionDraft {
    pub title: String,
    pub hook: String,
    pub body: String,
    #[serde(default)]
    pub format: Option<String>,
}

/// A fully expanded, scored content opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Rank of the kernel this was expanded from (0 = best kernel).
    pub kernel_rank: usize,
    pub title: String,
    pub hook: String,
    pub body: String,
    pub format: Option<String>,
    pub source_urls: Vec<String>,
    pub score: f64,
}

impl Candidate {
    pub fn from_draft(kernel_rank: usize, kernel: &Kernel, draft: ExpansionDraft) -> Self {
        let score = score_draft(kernel, &draft);
        Self {
            kernel_rank,
            title: draft.title.trim().to_string(),
            hook: draft.hook.trim().to_string(),
            body: draft.body.trim().to_string(),
            format: draft.format.map(|f| f.trim().to_string()).filter(|f| !f.is_empty()),
            source_urls: kernel.source_urls.clone(),
            score,
        }
    }
}

/// Deterministic score in `[0, 1]`: kernel confidence weighted with how
/// complete the hook and body are.
pub fn score_draft(kernel: &Kernel, draft: &ExpansionDraft) -> f64 {
    let confidence = kernel.confidence.clamp(0.0, 1.0);
    let hook_words = draft.hook.split_whitespace().count() as f64;
    let hook = (hook_words / 12.0).min(1.0);
    let body = (draft.body.trim().chars().count() as f64 / 600.0).min(1.0);
    let raw = 0.6 * confidence + 0.25 * hook + 0.15 * body;
    (raw * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    pub min_title_chars: usize,
    pub min_body_chars: usize,
    pub require_hook: bool,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            min_title_chars: 8,
            min_body_chars: 80,
            require_hook: true,
        }
    }
}

impl ValidationRules {
    pub fn accepts(&self, candidate: &Candidate) -> bool {
        candidate.title.chars().count() >= self.min_title_chars
            && candidate.body.chars().count() >= self.min_body_chars
            && (!self.require_hook || !candidate.hook.is_empty())
            && candidate.score.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Finalized {
    /// Sorted by score desc, then kernel rank.
    pub items: Vec<Candidate>,
    pub invalid_removed: usize,
    pub duplicates_removed: usize,
}

/// Filter invalid candidates, drop near-duplicates, sort by score.
///
/// Candidates are put in kernel-rank order before deduplication so the result
/// does not depend on the order expansions happened to finish in.
pub fn finalize(
    mut candidates: Vec<Candidate>,
    rules: &ValidationRules,
    similarity_threshold: f64,
) -> Finalized {
    let before = candidates.len();
    candidates.retain(|c| rules.accepts(c));
    let invalid_removed = before - candidates.len();

    candidates.sort_by_key(|c| c.kernel_rank);
    let (mut items, duplicates_removed) = dedupe_by_title(
        candidates,
        similarity_threshold,
        |c| c.title.as_str(),
        |c| c.score,
    );

    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.kernel_rank.cmp(&b.kernel_rank))
    });

    Finalized {
        items,
        invalid_removed,
        duplicates_removed,
    }
}
