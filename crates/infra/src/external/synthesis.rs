//! HTTP synthesis client for OpenAI-compatible chat completion endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use opforge_ai::{ModelTier, Prompt};

use crate::ai::{SynthesisClient, SynthesisError};
use crate::config::SynthesisEndpointConfig;

/// Upper bound on how much of an error body ends up in an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpSynthesisClient {
    client: reqwest::Client,
    endpoint: String,
    config: SynthesisEndpointConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpSynthesisClient {
    pub fn new(config: SynthesisEndpointConfig) -> Result<Self, SynthesisError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SynthesisError::Transport(format!("failed to build HTTP client: {e}")))?;
        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.config.fast_model,
            ModelTier::Heavy => &self.config.heavy_model,
        }
    }
}

/// Map a non-success response to its error category.
fn classify_status(status: StatusCode, retry_after: Option<&str>, body: &str) -> SynthesisError {
    let message = truncate(body.trim(), MAX_ERROR_BODY);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SynthesisError::Auth(message),
        StatusCode::PAYMENT_REQUIRED => SynthesisError::QuotaExhausted(message),
        StatusCode::TOO_MANY_REQUESTS => SynthesisError::RateLimited {
            retry_after: retry_after.and_then(parse_retry_after),
            message,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SynthesisError::Timeout,
        other => SynthesisError::Provider {
            status: other.as_u16(),
            message,
        },
    }
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn map_transport_error(err: reqwest::Error) -> SynthesisError {
    if err.is_timeout() {
        SynthesisError::Timeout
    } else {
        SynthesisError::Transport(err.to_string())
    }
}

fn first_message(response: ChatResponse) -> Result<String, SynthesisError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| SynthesisError::Provider {
            status: StatusCode::OK.as_u16(),
            message: "response carried no message content".to_string(),
        })
}

#[async_trait]
impl SynthesisClient for HttpSynthesisClient {
    async fn call(&self, prompt: Prompt, deadline: Duration) -> Result<String, SynthesisError> {
        let model = self.model_for(prompt.tier);
        let body = ChatRequest {
            model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: self.config.max_output_tokens,
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(deadline)
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read response body".into());
            let err = classify_status(status, retry_after.as_deref(), &text);
            warn!(model, status = status.as_u16(), category = ?err.category(), "synthesis call rejected");
            return Err(err);
        }

        let parsed: ChatResponse = response.json().await.map_err(map_transport_error)?;
        let content = first_message(parsed)?;
        debug!(model, chars = content.len(), "synthesis call completed");
        Ok(content)
    }
}
