use serde::{Deserialize, Serialize};

use opforge_core::DomainError;

/// Synthesis depth requested by the enqueuing application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMode {
    #[default]
    Standard,
    /// Pulls comments and transcripts too, and asks for longer expansions.
    Deep,
}

impl SynthesisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisMode::Standard => "standard",
            SynthesisMode::Deep => "deep",
        }
    }
}

impl core::fmt::Display for SynthesisMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for SynthesisMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(SynthesisMode::Standard),
            "deep" => Ok(SynthesisMode::Deep),
            other => Err(DomainError::validation(format!("unknown synthesis mode: {other}"))),
        }
    }
}
