//! Budget/gate policy: deterministic evidence sufficiency checks.
//!
//! Gates run once, before any paid synthesis call. A failing gate is a hard
//! block; the report lists every failed sub-check with the required and actual
//! values so callers can render remediation text without re-deriving it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::evidence::{EvidenceSet, EvidenceStats, Platform};

/// Quality thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub min_items: usize,
    pub min_text_items: usize,
    /// A record counts toward `min_text_items` at this many characters.
    pub min_text_chars: usize,
    pub min_rich_fraction: f64,
    /// At least one record must be newer than this many days.
    pub freshness_days: i64,
    pub required_platforms: Vec<Platform>,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_items: 8,
            min_text_items: 5,
            min_text_chars: 40,
            min_rich_fraction: 0.2,
            freshness_days: 30,
            required_platforms: Vec::new(),
        }
    }
}

/// Anti single-source-bias thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsabilityGate {
    pub min_distinct_authors: usize,
    pub min_distinct_urls: usize,
    pub max_duplicate_ratio: f64,
}

impl Default for UsabilityGate {
    fn default() -> Self {
        Self {
            min_distinct_authors: 3,
            min_distinct_urls: 5,
            max_duplicate_ratio: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatePolicy {
    pub quality: QualityGate,
    pub usability: UsabilityGate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Quality,
    Usability,
}

/// Individual sub-check identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "check")]
pub enum GateCheck {
    MinItems,
    MinTextItems,
    RichContentFraction,
    Freshness,
    RequiredPlatform { platform: Platform },
    DistinctAuthors,
    DistinctUrls,
    DuplicateRatio,
}

impl GateCheck {
    pub fn gate(&self) -> GateKind {
        match self {
            GateCheck::MinItems
            | GateCheck::MinTextItems
            | GateCheck::RichContentFraction
            | GateCheck::Freshness
            | GateCheck::RequiredPlatform { .. } => GateKind::Quality,
            GateCheck::DistinctAuthors | GateCheck::DistinctUrls | GateCheck::DuplicateRatio => {
                GateKind::Usability
            }
        }
    }

    /// `true` when `actual` must stay at or below `required`.
    pub fn is_ceiling(&self) -> bool {
        matches!(self, GateCheck::DuplicateRatio)
    }

    pub fn remediation(&self) -> String {
        match self {
            GateCheck::MinItems => "connect more sources to collect more evidence".to_string(),
            GateCheck::MinTextItems => {
                "add sources with substantive written posts or comments".to_string()
            }
            GateCheck::RichContentFraction => {
                "connect video sources with transcripts for richer evidence".to_string()
            }
            GateCheck::Freshness => "sync sources to pull in recent posts".to_string(),
            GateCheck::RequiredPlatform { platform } => format!("connect a {platform} source"),
            GateCheck::DistinctAuthors => {
                "broaden sources beyond a handful of authors".to_string()
            }
            GateCheck::DistinctUrls => "add more distinct posts or threads".to_string(),
            GateCheck::DuplicateRatio => "remove duplicated or cross-posted sources".to_string(),
        }
    }
}

/// One failed sub-check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortfall {
    #[serde(flatten)]
    pub check: GateCheck,
    pub required: f64,
    pub actual: f64,
}

impl Shortfall {
    fn new(check: GateCheck, required: f64, actual: f64) -> Self {
        Self {
            check,
            required,
            actual,
        }
    }

    /// How far from passing, always non-negative.
    pub fn gap(&self) -> f64 {
        if self.check.is_ceiling() {
            (self.actual - self.required).max(0.0)
        } else {
            (self.required - self.actual).max(0.0)
        }
    }
}

/// Outcome of evaluating both gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub passed: bool,
    pub quality_passed: bool,
    pub usability_passed: bool,
    pub shortfalls: Vec<Shortfall>,
    pub stats: EvidenceStats,
}

impl GateReport {
    pub fn failed_checks(&self) -> impl Iterator<Item = &GateCheck> {
        self.shortfalls.iter().map(|s| &s.check)
    }

    pub fn remediation(&self) -> Vec<String> {
        self.shortfalls.iter().map(|s| s.check.remediation()).collect()
    }

    /// One-line operator summary, e.g. for `last_error`.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .shortfalls
            .iter()
            .map(|s| {
                format!(
                    "{} (required {}, actual {})",
                    check_label(&s.check),
                    trim_float(s.required),
                    trim_float(s.actual)
                )
            })
            .collect();
        format!("insufficient evidence: {}", parts.join("; "))
    }
}

impl GatePolicy {
    /// Evaluate both gates against `evidence` as of `now`.
    pub fn evaluate(&self, evidence: &EvidenceSet, now: DateTime<Utc>) -> GateReport {
        let stats = EvidenceStats::compute(
            evidence.records(),
            now,
            self.quality.min_text_chars,
            self.quality.freshness_days,
        );
        self.evaluate_stats(stats)
    }

    pub fn evaluate_stats(&self, stats: EvidenceStats) -> GateReport {
        let quality = self.quality_shortfalls(&stats);
        let usability = self.usability_shortfalls(&stats);
        let quality_passed = quality.is_empty();
        let usability_passed = usability.is_empty();

        let mut shortfalls = quality;
        shortfalls.extend(usability);

        GateReport {
            passed: quality_passed && usability_passed,
            quality_passed,
            usability_passed,
            shortfalls,
            stats,
        }
    }

    fn quality_shortfalls(&self, stats: &EvidenceStats) -> Vec<Shortfall> {
        let q = &self.quality;
        let mut out = Vec::new();

        if stats.total < q.min_items {
            out.push(Shortfall::new(
                GateCheck::MinItems,
                q.min_items as f64,
                stats.total as f64,
            ));
        }
        if stats.text_items < q.min_text_items {
            out.push(Shortfall::new(
                GateCheck::MinTextItems,
                q.min_text_items as f64,
                stats.text_items as f64,
            ));
        }
        if stats.rich_fraction < q.min_rich_fraction {
            out.push(Shortfall::new(
                GateCheck::RichContentFraction,
                q.min_rich_fraction,
                stats.rich_fraction,
            ));
        }
        if stats.fresh_items == 0 {
            out.push(Shortfall::new(GateCheck::Freshness, 1.0, 0.0));
        }
        for platform in &q.required_platforms {
            let count = stats.platform_count(*platform);
            if count == 0 {
                out.push(Shortfall::new(
                    GateCheck::RequiredPlatform {
                        platform: *platform,
                    },
                    1.0,
                    0.0,
                ));
            }
        }
        out
    }

    fn usability_shortfalls(&self, stats: &EvidenceStats) -> Vec<Shortfall> {
        let u = &self.usability;
        let mut out = Vec::new();

        if stats.distinct_authors < u.min_distinct_authors {
            out.push(Shortfall::new(
                GateCheck::DistinctAuthors,
                u.min_distinct_authors as f64,
                stats.distinct_authors as f64,
            ));
        }
        if stats.distinct_urls < u.min_distinct_urls {
            out.push(Shortfall::new(
                GateCheck::DistinctUrls,
                u.min_distinct_urls as f64,
                stats.distinct_urls as f64,
            ));
        }
        if stats.duplicate_ratio > u.max_duplicate_ratio {
            out.push(Shortfall::new(
                GateCheck::DuplicateRatio,
                u.max_duplicate_ratio,
                stats.duplicate_ratio,
            ));
        }
        out
    }
}

fn check_label(check: &GateCheck) -> String {
    match check {
        GateCheck::MinItems => "evidence items".to_string(),
        GateCheck::MinTextItems => "text items".to_string(),
        GateCheck::RichContentFraction => "rich content fraction".to_string(),
        GateCheck::Freshness => "fresh items".to_string(),
        GateCheck::RequiredPlatform { platform } => format!("{platform} items"),
        GateCheck::DistinctAuthors => "distinct authors".to_string(),
        GateCheck::DistinctUrls => "distinct urls".to_string(),
        GateCheck::DuplicateRatio => "duplicate ratio".to_string(),
    }
}

fn trim_float(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value:.2}")
    }
}
