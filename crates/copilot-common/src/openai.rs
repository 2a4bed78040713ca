/// Client for OpenAI-compatible chat completion endpoints.
///
/// Works against OpenAI itself and against local hosts that speak the same protocol
/// (Ollama's `/v1`, vLLM, llama.cpp server). One request per call: the caller owns the
/// overall deadline and decides what a failure means for its stage.
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct LlmClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    /// Error bodies longer than this are cut before they reach an error message.
    pub max_error_body_bytes: usize,
}

impl LlmClientConfig {
    /// Load client settings from environment variables, falling back to local defaults.
    ///
    /// - `LLM_BASE_URL` (default `http://localhost:11434/v1`)
    /// - `LLM_API_KEY` (optional, sent as a bearer token)
    /// - `LLM_MODEL` (default `llama3.2:3b`)
    /// - `LLM_TEMPERATURE` (default 0), `LLM_MAX_TOKENS` (default 1024)
    /// - `LLM_TIMEOUT_SECS` (default 120)
    /// - `LLM_MAX_ERROR_BODY_BYTES` (default 2048)
    pub fn from_env() -> Self {
        let base_url = std::env::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:11434/v1".to_string());
        let api_key = std::env::var("LLM_API_KEY").ok().filter(|k| !k.trim().is_empty());
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "llama3.2:3b".to_string());

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            temperature: env_parse("LLM_TEMPERATURE").unwrap_or(0.0),
            max_tokens: env_parse("LLM_MAX_TOKENS").unwrap_or(1024),
            request_timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS").unwrap_or(120)),
            max_error_body_bytes: env_parse("LLM_MAX_ERROR_BODY_BYTES").unwrap_or(2048),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

#[derive(Debug, thiserror::Error)]
pub enum LlmClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("host answered {status}: {detail}")]
    Status { status: StatusCode, detail: String },

    #[error("invalid response JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("response contained no message content")]
    EmptyCompletion,
}

impl LlmClientError {
    /// True when the failure says nothing about the prompt: the host could not be reached,
    /// timed out, or reported itself overloaded.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect(),
            Self::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::BAD_GATEWAY
                    || *status == StatusCode::SERVICE_UNAVAILABLE
                    || *status == StatusCode::GATEWAY_TIMEOUT
            }
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(e) if e.is_timeout())
    }
}

#[derive(Clone)]
pub struct LlmClient {
    config: LlmClientConfig,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmClientConfig) -> Result<Self, LlmClientError> {
        let http = reqwest::Client::builder()
            .user_agent("clinical-copilot/llm-client")
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &LlmClientConfig {
        &self.config
    }

    /// Send a system + user message pair and return the first choice's text.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String, LlmClientError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatTurn {
                    role: "system",
                    content: system,
                },
                ChatTurn {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let url = format!("{}/chat/completions", self.config.base_url);
        let mut builder = self.http.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        debug!(%status, bytes = body.len(), model = %self.config.model, "chat completion returned");
        if !status.is_success() {
            return Err(LlmClientError::Status {
                status,
                detail: error_detail(&body, self.config.max_error_body_bytes),
            });
        }
        first_choice_text(&body)
    }
}

fn first_choice_text(body: &[u8]) -> Result<String, LlmClientError> {
    let response: ChatResponse = serde_json::from_slice(body)?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|s| !s.trim().is_empty())
        .ok_or(LlmClientError::EmptyCompletion)
}

/// The `error.message` of an OpenAI-style error body, or the body itself, cut to `max_bytes`.
fn error_detail(body: &[u8], max_bytes: usize) -> String {
    let message = serde_json::from_slice::<Value>(body).ok().and_then(|v| {
        v.pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let text = message.unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    let mut end = text.len().min(max_bytes);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].trim().to_string()
}

#[derive(Serialize)]
struct ChatTurn<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatTurn<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}
