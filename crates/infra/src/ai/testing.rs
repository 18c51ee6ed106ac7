//! Test doubles shared by runner, worker and integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use opforge_ai::{EvidenceRecord, ModelTier, Platform, Prompt};

use super::collaborators::{SynthesisClient, SynthesisError};

/// Record `n`; distinct author, URL and text, alternating platforms.
pub(crate) fn record(n: usize, as_of: DateTime<Utc>) -> EvidenceRecord {
    EvidenceRecord {
        platform: if n % 2 == 0 {
            Platform::Reddit
        } else {
            Platform::Youtube
        },
        text: format!("Thread {n}: founders compare what actually moved retention for their product"),
        has_rich_content: n % 2 == 1,
        author: format!("author-{n}"),
        url: format!("https://example.com/posts/{n}"),
        published_at: as_of - chrono::Duration::hours(n as i64),
        engagement: None,
    }
}

/// `count` records that pass the default gate policy when `count >= 8`.
pub(crate) fn healthy_records(count: usize, as_of: DateTime<Utc>) -> Vec<EvidenceRecord> {
    (0..count).map(|n| record(n, as_of)).collect()
}

pub(crate) enum Reply {
    Text(String),
    Fail(SynthesisError),
    /// Answers with the text once the delay has passed.
    After(Duration, String),
    /// Never answers within any realistic deadline.
    Hang,
}

type Script = Box<dyn Fn(usize) -> Reply + Send + Sync>;

/// Synthesis client answering from per-key scripts.
///
/// Kernel calls are keyed by the number of the first record in the group
/// (`/posts/{n}`); expansion calls by the number at the end of the kernel
/// title (`Kernel {n}`).
pub(crate) struct ScriptedSynthesis {
    kernel: Script,
    expansion: Script,
    fast_calls: AtomicUsize,
    heavy_calls: AtomicUsize,
}

impl ScriptedSynthesis {
    pub(crate) fn new() -> Self {
        Self {
            kernel: Box::new(|n| Reply::Text(kernel_reply(n, 0.8))),
            expansion: Box::new(|n| Reply::Text(expansion_reply(n))),
            fast_calls: AtomicUsize::new(0),
            heavy_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_kernel(mut self, script: impl Fn(usize) -> Reply + Send + Sync + 'static) -> Self {
        self.kernel = Box::new(script);
        self
    }

    pub(crate) fn with_expansion(
        mut self,
        script: impl Fn(usize) -> Reply + Send + Sync + 'static,
    ) -> Self {
        self.expansion = Box::new(script);
        self
    }

    pub(crate) fn fast_calls(&self) -> usize {
        self.fast_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn heavy_calls(&self) -> usize {
        self.heavy_calls.load(Ordering::SeqCst)
    }
}

pub(crate) fn kernel_reply(n: usize, confidence: f64) -> String {
    format!(r#"{{"title": "Kernel {n}", "angle": "teardown", "confidence": {confidence}}}"#)
}

pub(crate) fn expansion_reply(n: usize) -> String {
    titled_expansion_reply(&format!("Expanded brief {n}"))
}

pub(crate) fn titled_expansion_reply(title: &str) -> String {
    format!(
        r#"{{"title": "{title}", "hook": "Most teams lose users in week one and never notice why", "body": "{}", "format": "carousel"}}"#,
        "Walk through the three onboarding emails that changed retention. ".repeat(3)
    )
}

fn kernel_key(prompt: &Prompt) -> usize {
    prompt
        .user
        .split("/posts/")
        .nth(1)
        .map(|rest| rest.chars().take_while(char::is_ascii_digit).collect::<String>())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(usize::MAX)
}

fn expansion_key(prompt: &Prompt) -> usize {
    prompt
        .user
        .lines()
        .next()
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX)
}

#[async_trait]
impl SynthesisClient for ScriptedSynthesis {
    async fn call(&self, prompt: Prompt, _deadline: Duration) -> Result<String, SynthesisError> {
        let reply = match prompt.tier {
            ModelTier::Fast => {
                self.fast_calls.fetch_add(1, Ordering::SeqCst);
                (self.kernel)(kernel_key(&prompt))
            }
            ModelTier::Heavy => {
                self.heavy_calls.fetch_add(1, Ordering::SeqCst);
                (self.expansion)(expansion_key(&prompt))
            }
        };
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail(err) => Err(err),
            Reply::After(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Err(SynthesisError::Timeout)
            }
        }
    }
}
