//! Evidence records and coverage statistics.
//!
//! Evidence arrives already normalized from the acquisition layer. This module
//! only describes its shape and derives the numbers the gates look at.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use opforge_core::{DomainError, TargetId};

/// Upper bound on records kept per evidence set.
pub const MAX_EVIDENCE_ITEMS: usize = 200;

/// Source platform of an evidence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Reddit,
    Youtube,
    Tiktok,
    Instagram,
    X,
    Linkedin,
    Web,
}

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::Reddit,
        Platform::Youtube,
        Platform::Tiktok,
        Platform::Instagram,
        Platform::X,
        Platform::Linkedin,
        Platform::Web,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Reddit => "reddit",
            Platform::Youtube => "youtube",
            Platform::Tiktok => "tiktok",
            Platform::Instagram => "instagram",
            Platform::X => "x",
            Platform::Linkedin => "linkedin",
            Platform::Web => "web",
        }
    }
}

impl core::fmt::Display for Platform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Platform {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == lowered)
            .or(match lowered.as_str() {
                "twitter" => Some(Platform::X),
                _ => None,
            })
            .ok_or_else(|| DomainError::validation(format!("unknown platform: {s}")))
    }
}

/// Optional engagement counters attached to a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engagement {
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub views: u64,
}

/// A single normalized piece of social evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub platform: Platform,
    pub text: String,
    /// Transcript (or equivalent long-form body) present.
    pub has_rich_content: bool,
    pub author: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engagement: Option<Engagement>,
}

impl EvidenceRecord {
    /// URL with scheme/host lowercased, fragment and trailing slash removed.
    pub fn canonical_url(&self) -> String {
        canonical_url(&self.url)
    }

    pub fn normalized_author(&self) -> String {
        self.author.trim().to_lowercase()
    }

    pub fn text_chars(&self) -> usize {
        self.text.trim().chars().count()
    }
}

/// Bounded, ordered list of evidence for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSet {
    pub target_id: TargetId,
    records: Vec<EvidenceRecord>,
}

impl EvidenceSet {
    /// Build a set, truncating to [`MAX_EVIDENCE_ITEMS`].
    pub fn new(target_id: TargetId, mut records: Vec<EvidenceRecord>) -> Self {
        records.truncate(MAX_EVIDENCE_ITEMS);
        Self { target_id, records }
    }

    pub fn records(&self) -> &[EvidenceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Coverage statistics derived from an evidence set at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceStats {
    pub total: usize,
    /// Records whose text has at least `min_text_chars` characters.
    pub text_items: usize,
    pub rich_items: usize,
    pub rich_fraction: f64,
    /// Records published within the freshness window.
    pub fresh_items: usize,
    pub per_platform: BTreeMap<Platform, usize>,
    pub distinct_authors: usize,
    pub distinct_urls: usize,
    /// Records whose normalized text repeats an earlier record.
    pub duplicate_items: usize,
    pub duplicate_ratio: f64,
    pub newest_published_at: Option<DateTime<Utc>>,
}

impl EvidenceStats {
    pub fn compute(
        records: &[EvidenceRecord],
        as_of: DateTime<Utc>,
        min_text_chars: usize,
        freshness_days: i64,
    ) -> Self {
        let total = records.len();
        // Out-of-range windows reach back to the earliest representable instant.
        let fresh_cutoff = Duration::try_days(freshness_days)
            .and_then(|window| as_of.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut per_platform = BTreeMap::new();
        let mut authors = BTreeSet::new();
        let mut urls = BTreeSet::new();
        let mut seen_text = HashSet::new();
        let mut stats = EvidenceStats {
            total,
            ..Default::default()
        };

        for record in records {
            *per_platform.entry(record.platform).or_insert(0) += 1;

            if record.text_chars() >= min_text_chars {
                stats.text_items += 1;
            }
            if record.has_rich_content {
                stats.rich_items += 1;
            }
            if record.published_at >= fresh_cutoff {
                stats.fresh_items += 1;
            }

            let author = record.normalized_author();
            if !author.is_empty() {
                authors.insert(author);
            }
            let url = record.canonical_url();
            if !url.is_empty() {
                urls.insert(url);
            }

            let normalized = normalize_text(&record.text);
            if !normalized.is_empty() && !seen_text.insert(normalized) {
                stats.duplicate_items += 1;
            }

            stats.newest_published_at = Some(match stats.newest_published_at {
                Some(newest) if newest >= record.published_at => newest,
                _ => record.published_at,
            });
        }

        stats.per_platform = per_platform;
        stats.distinct_authors = authors.len();
        stats.distinct_urls = urls.len();
        if total > 0 {
            stats.rich_fraction = stats.rich_items as f64 / total as f64;
            stats.duplicate_ratio = stats.duplicate_items as f64 / total as f64;
        }
        stats
    }

    pub fn platform_count(&self, platform: Platform) -> usize {
        self.per_platform.get(&platform).copied().unwrap_or(0)
    }
}

/// Lowercase, strip everything but alphanumerics, collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn canonical_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or_default();
    let (scheme, rest) = match without_fragment.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
        None => (None, without_fragment),
    };
    let (host, path) = match rest.split_once('/') {
        Some((host, path)) => (host.to_ascii_lowercase(), format!("/{path}")),
        None => (rest.to_ascii_lowercase(), String::new()),
    };
    let path = path.trim_end_matches('/');
    match scheme {
        Some(scheme) => format!("{scheme}://{host}{path}"),
        None => format!("{host}{path}"),
    }
}
