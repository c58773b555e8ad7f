use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::{LlmProfileConfig, LlmProfiles};

/// Failures of the external LLM capability. Every variant is retryable up to
/// the configured bound; exhaustion becomes a per-unit drop, never a batch
/// abort.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("cannot reach LLM endpoint {0}")]
    Connection(String),

    #[error("LLM request timed out after {0}s")]
    Timeout(u64),

    #[error("LLM endpoint rate-limited the request")]
    RateLimited,

    #[error("LLM endpoint returned error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("malformed completion: {0}")]
    MalformedCompletion(String),
}

/// The LLM capability as the pipeline sees it: structured prompt in, raw
/// completion text or an explicit failure out. Callers validate schema
/// conformance themselves.
pub trait LlmClient: Send + Sync {
    fn complete(&self, system: &str, user: &str) -> Result<String, LlmError>;
}

/// Blocking client for an OpenAI-compatible chat-completions endpoint.
pub struct OpenAiChatClient {
    model: String,
    base_url: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
    timeout_secs: u64,
    client: reqwest::blocking::Client,
}

impl OpenAiChatClient {
    pub fn from_profile(profile: &LlmProfileConfig) -> Result<Self> {
        let api_key = profile.resolve_api_key()?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(profile.timeout_secs))
            .build()
            .context("failed to build HTTP client for LLM profile")?;

        Ok(Self {
            model: profile.model.clone(),
            base_url: profile.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_tokens: profile.max_tokens,
            temperature: profile.temperature,
            timeout_secs: profile.timeout_secs,
            client,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl LlmClient for OpenAiChatClient {
    fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::Timeout(self.timeout_secs)
                } else if err.is_connect() {
                    LlmError::Connection(self.base_url.clone())
                } else {
                    LlmError::Http(err.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|err| LlmError::MalformedCompletion(err.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| LlmError::MalformedCompletion("empty completion".to_string()))
    }
}

/// The three configured capability profiles, built once per run.
pub struct LlmRouter {
    pub default: Box<dyn LlmClient>,
    pub reasoning: Box<dyn LlmClient>,
    pub retrieval: Box<dyn LlmClient>,
}

impl LlmRouter {
    pub fn from_profiles(profiles: &LlmProfiles) -> Result<Self> {
        Ok(Self {
            default: Box::new(OpenAiChatClient::from_profile(&profiles.default)?),
            reasoning: Box::new(OpenAiChatClient::from_profile(&profiles.reasoning)?),
            retrieval: Box::new(OpenAiChatClient::from_profile(&profiles.retrieval)?),
        })
    }
}

/// Bounded retry around one LLM call. Returns the last error once the budget
/// is exhausted; the caller decides what unit of work gets dropped.
pub fn with_retry<T>(
    max_attempts: usize,
    what: &str,
    mut op: impl FnMut() -> Result<T, LlmError>,
) -> Result<T, LlmError> {
    let mut last_err = None;
    for attempt in 1..=max_attempts.max(1) {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(what, attempt, error = %err, "LLM call failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or(LlmError::MalformedCompletion("no attempts made".to_string())))
}

/// Content of the outermost curly braces, dropping prose and code fences the
/// model may wrap around its JSON.
pub fn extract_brace_content(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if start < end { Some(&raw[start..=end]) } else { None }
}

/// Same as [`extract_brace_content`] for JSON arrays.
pub fn extract_bracket_content(raw: &str) -> Option<&str> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if start < end { Some(&raw[start..=end]) } else { None }
}

pub fn parse_json_object<T: DeserializeOwned>(raw: &str) -> Result<T, LlmError> {
    let content = extract_brace_content(raw)
        .ok_or_else(|| LlmError::MalformedCompletion("no JSON object in completion".to_string()))?;
    serde_json::from_str(content).map_err(|err| LlmError::MalformedCompletion(err.to_string()))
}

pub fn parse_json_array<T: DeserializeOwned>(raw: &str) -> Result<T, LlmError> {
    let content = extract_bracket_content(raw)
        .ok_or_else(|| LlmError::MalformedCompletion("no JSON array in completion".to_string()))?;
    serde_json::from_str(content).map_err(|err| LlmError::MalformedCompletion(err.to_string()))
}

#[cfg(test)]
pub use mock::MockLlmClient;

#[cfg(test)]
mod mock {
    use std::sync::Mutex;

    use super::{LlmClient, LlmError};

    /// Scripted client for stage tests: replies are consumed in order, the
    /// last one repeating; `Err` entries simulate service failures.
    pub struct MockLlmClient {
        replies: Vec<Result<String, String>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl MockLlmClient {
        pub fn new(response: &str) -> Self {
            Self::scripted(vec![Ok(response.to_string())])
        }

        pub fn scripted(replies: Vec<Result<String, String>>) -> Self {
            assert!(!replies.is_empty());
            Self {
                replies,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn always_failing(detail: &str) -> Self {
            Self::scripted(vec![Err(detail.to_string())])
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl LlmClient for MockLlmClient {
        fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
            let mut calls = self.calls.lock().unwrap();
            let index = calls.len().min(self.replies.len() - 1);
            calls.push((system.to_string(), user.to_string()));

            match &self.replies[index] {
                Ok(reply) => Ok(reply.clone()),
                Err(detail) => Err(LlmError::Http(detail.clone())),
            }
        }
    }
}
