//! OpenAI-compatible chat-completions transport.
//!
//! One function, one request: the scheduler decides retries, fallback, and
//! batching. Errors are typed by kind so callers route on structure, never
//! on message text.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{LlmErrorKind, LocPipeError, Result};
use crate::trace::TokenUsage;

/// Default request timeout when `LLM_TIMEOUT_S` is unset.
const DEFAULT_TIMEOUT_S: u64 = 60;

/// A single chat-completions request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub response_format: Option<String>,
    pub timeout: Duration,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            user: user.into(),
            temperature: 0.2,
            max_tokens: None,
            response_format: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_S),
        }
    }
}

/// A successful chat-completions response.
#[derive(Debug, Clone)]
pub struct LlmResult {
    pub text: String,
    pub latency_ms: u64,
    pub request_id: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: String,
    /// Prompt character count, for fallback token estimation.
    pub req_chars: usize,
    /// Response character count, for fallback token estimation.
    pub resp_chars: usize,
}

/// The seam between the scheduler and the wire. Tests substitute scripted
/// fakes; production uses [`HttpTransport`].
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn chat(&self, request: &LlmRequest) -> Result<LlmResult>;
}

/// Reqwest-backed transport against an OpenAI-compatible endpoint.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    /// Build from explicit settings.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        let api_key = api_key.into().trim().to_string();
        if base_url.is_empty() || api_key.is_empty() {
            return Err(LocPipeError::llm(
                LlmErrorKind::Config,
                "missing LLM configuration; set LLM_BASE_URL and LLM_API_KEY",
                None,
            ));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LocPipeError::llm(LlmErrorKind::Config, format!("http client: {}", e), None))?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// Build from `LLM_BASE_URL` and `LLM_API_KEY` (or `LLM_API_KEY_FILE`).
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("LLM_BASE_URL").unwrap_or_default();
        let api_key = match std::env::var("LLM_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => match std::env::var("LLM_API_KEY_FILE") {
                Ok(path) => std::fs::read_to_string(PathBuf::from(path.trim()))
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default(),
                Err(_) => String::new(),
            },
        };
        Self::new(base_url, api_key)
    }

    /// Timeout from `LLM_TIMEOUT_S`, defaulting to 60 seconds.
    pub fn env_timeout() -> Duration {
        let secs = std::env::var("LLM_TIMEOUT_S")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_S);
        Duration::from_secs(secs)
    }
}

/// Build the chat-completions payload for a request.
fn build_payload(request: &LlmRequest) -> Value {
    let mut payload = json!({
        "model": request.model,
        "temperature": request.temperature,
        "messages": [
            {"role": "system", "content": request.system},
            {"role": "user", "content": request.user}
        ],
    });
    if let Some(max_tokens) = request.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if let Some(format) = &request.response_format {
        payload["response_format"] = json!({"type": format});
    }
    payload
}

/// Extract OpenAI-style usage. Gateways that omit the field yield `None`.
fn extract_usage(data: &Value) -> Option<TokenUsage> {
    let usage = data.get("usage")?.as_object()?;
    let pt = usage.get("prompt_tokens").and_then(Value::as_u64);
    let ct = usage.get("completion_tokens").and_then(Value::as_u64);
    let tt = usage.get("total_tokens").and_then(Value::as_u64);
    if pt.is_none() && ct.is_none() && tt.is_none() {
        return None;
    }
    let pt = pt.unwrap_or(0);
    let ct = ct.unwrap_or(0);
    Some(TokenUsage {
        prompt_tokens: pt,
        completion_tokens: ct,
        total_tokens: tt.unwrap_or(pt + ct),
    })
}

/// Pull text, request id, and usage out of a response body.
fn parse_body(data: &Value) -> Result<(String, Option<String>, Option<TokenUsage>)> {
    let text = data
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            LocPipeError::llm(
                LlmErrorKind::Parse,
                "response missing choices[0].message.content",
                None,
            )
        })?;
    let request_id = data.get("id").and_then(Value::as_str).map(String::from);
    Ok((text.to_string(), request_id, extract_usage(data)))
}

#[async_trait]
impl LlmTransport for HttpTransport {
    async fn chat(&self, request: &LlmRequest) -> Result<LlmResult> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = build_payload(request);
        let req_chars = request.system.len() + request.user.len();

        let t0 = Instant::now();
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LocPipeError::llm(
                        LlmErrorKind::Timeout,
                        format!("request timeout after {:?}: {}", request.timeout, e),
                        None,
                    )
                } else {
                    LocPipeError::llm(LlmErrorKind::Network, format!("network error: {}", e), None)
                }
            })?;
        let latency_ms = t0.elapsed().as_millis() as u64;

        let status = response.status().as_u16();
        if status == 429 || (500..=599).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(LocPipeError::llm(
                LlmErrorKind::Upstream,
                format!("upstream error HTTP {}: {}", status, truncate(&body, 200)),
                Some(status),
            ));
        }
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(LocPipeError::llm(
                LlmErrorKind::Http,
                format!("HTTP error {}: {}", status, truncate(&body, 200)),
                Some(status),
            ));
        }

        let data: Value = response.json().await.map_err(|e| {
            LocPipeError::llm(
                LlmErrorKind::Parse,
                format!("response parse error: {}", e),
                Some(status),
            )
        })?;

        let (text, request_id, usage) = parse_body(&data)?;
        let resp_chars = text.len();
        Ok(LlmResult {
            text,
            latency_ms,
            request_id,
            usage,
            model: request.model.clone(),
            req_chars,
            resp_chars,
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
