//! Prompt construction and model output parsing.
//!
//! Both model tiers are asked for a single JSON object. Parsing tolerates
//! surrounding prose or code fences but nothing else; anything unparseable is
//! an [`OutputError`] and the task counts as failed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evidence::EvidenceRecord;
use crate::kernel::Kernel;
use crate::mode::SynthesisMode;
use crate::scoring::ExpansionDraft;

/// Cost/quality tier of a synthesis call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Cheap, short-deadline calls (kernel generation).
    Fast,
    /// Expensive calls (expansion).
    Heavy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub tier: ModelTier,
    pub system: String,
    pub user: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutputError {
    #[error("model output contains no JSON object")]
    NoJson,

    #[error("malformed model output: {0}")]
    Malformed(String),

    #[error("model output missing field: {0}")]
    MissingField(&'static str),
}

const KERNEL_SYSTEM: &str = "You turn social media evidence into one content opportunity. \
Reply with a single JSON object: {\"title\": string, \"angle\": string, \"confidence\": number between 0 and 1}.";

const EXPANSION_SYSTEM: &str = "You expand a content opportunity into a ready-to-produce brief. \
Reply with a single JSON object: {\"title\": string, \"hook\": string, \"body\": string, \"format\": string}.";

/// Cap on characters of a single record included in a kernel prompt.
const MAX_RECORD_CHARS: usize = 1_200;

pub fn kernel_prompt(mode: SynthesisMode, records: &[EvidenceRecord]) -> Prompt {
    let mut user = format!("Mode: {mode}\nEvidence:\n");
    for (i, record) in records.iter().enumerate() {
        let text: String = record.text.trim().chars().take(MAX_RECORD_CHARS).collect();
        user.push_str(&format!(
            "{}. [{}] {} ({})\n{}\n",
            i + 1,
            record.platform,
            record.author.trim(),
            record.canonical_url(),
            text
        ));
    }
    Prompt {
        tier: ModelTier::Fast,
        system: KERNEL_SYSTEM.to_string(),
        user,
    }
}

pub fn expansion_prompt(mode: SynthesisMode, kernel: &Kernel) -> Prompt {
    let length = match mode {
        SynthesisMode::Standard => "Keep the body under 150 words.",
        SynthesisMode::Deep => "Write a body of 250 to 400 words with concrete examples.",
    };
    let user = format!(
        "Opportunity: {}\nAngle: {}\nSources:\n{}\n{length}",
        kernel.title.trim(),
        kernel.angle.trim(),
        kernel.source_urls.join("\n"),
    );
    Prompt {
        tier: ModelTier::Heavy,
        system: EXPANSION_SYSTEM.to_string(),
        user,
    }
}

#[derive(Debug, Deserialize)]
struct RawKernel {
    title: Option<String>,
    #[serde(default)]
    angle: Option<String>,
    confidence: Option<f64>,
}

/// Parse a kernel reply for the evidence group at `index`.
pub fn parse_kernel(
    output: &str,
    index: usize,
    source_urls: Vec<String>,
) -> Result<Kernel, OutputError> {
    let raw: RawKernel = parse_object(output)?;
    let title = raw
        .title
        .filter(|t| !t.trim().is_empty())
        .ok_or(OutputError::MissingField("title"))?;
    let confidence = raw.confidence.ok_or(OutputError::MissingField("confidence"))?;
    if !confidence.is_finite() {
        return Err(OutputError::Malformed("confidence is not a number".to_string()));
    }
    Ok(Kernel {
        index,
        title: title.trim().to_string(),
        angle: raw.angle.unwrap_or_default().trim().to_string(),
        confidence: confidence.clamp(0.0, 1.0),
        source_urls,
    })
}

pub fn parse_expansion(output: &str) -> Result<ExpansionDraft, OutputError> {
    let draft: ExpansionDraft = parse_object(output)?;
    if draft.title.trim().is_empty() {
        return Err(OutputError::MissingField("title"));
    }
    if draft.body.trim().is_empty() {
        return Err(OutputError::MissingField("body"));
    }
    Ok(draft)
}

fn parse_object<T: for<'de> Deserialize<'de>>(output: &str) -> Result<T, OutputError> {
    let start = output.find('{').ok_or(OutputError::NoJson)?;
    let end = output.rfind('}').ok_or(OutputError::NoJson)?;
    if end < start {
        return Err(OutputError::NoJson);
    }
    serde_json::from_str(&output[start..=end]).map_err(|e| OutputError::Malformed(e.to_string()))
}
