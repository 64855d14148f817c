//! The upstream completion call.
//!
//! The relay sends a two-turn conversation to an OpenAI-style
//! chat-completions endpoint: the persona configuration as the system
//! turn (with the delimiter marker appended) and the sanitized user
//! message.  One attempt per request, no retries; failures surface to the
//! caller as upstream errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::SYSTEM_DELIMITER;

/// Fixed refusal returned when the upstream reply trips the output filter.
/// The filtered text itself never reaches the client.
pub const APOLOGY: &str = "I apologise, but I cannot provide that information.";

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";

const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 500;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("upstream reply missing completion text")]
    MissingContent,
}

#[derive(Serialize)]
struct Turn<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [Turn<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionReply {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Client for the external completion API.  The persona configuration is
/// injected verbatim as the system turn; it is never inspected beyond
/// appending the delimiter marker, which lets the pattern filter catch
/// user messages that reference it.
pub struct UpstreamClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: String,
}

impl UpstreamClient {
    pub fn new(
        url: String,
        api_key: Option<String>,
        model: String,
        persona: &str,
        timeout_ms: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        let system_prompt = format!("{persona}\n\nDelimiter: {SYSTEM_DELIMITER}");
        UpstreamClient {
            client,
            url,
            api_key,
            model,
            system_prompt,
        }
    }

    /// Forward the sanitized message and return the reply text extracted
    /// from the first completion choice.  A missing or empty completion is
    /// an upstream-contract failure, not a client error.
    pub async fn complete(&self, sanitized_message: &str) -> Result<String, UpstreamError> {
        let body = CompletionRequest {
            model: &self.model,
            messages: [
                Turn {
                    role: "system",
                    content: &self.system_prompt,
                },
                Turn {
                    role: "user",
                    content: sanitized_message,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };
        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status));
        }
        let reply: CompletionReply = response.json().await?;
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.is_empty())
            .ok_or(UpstreamError::MissingContent)
    }
}
