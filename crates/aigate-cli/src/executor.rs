use std::time::Duration;

use aigate_common::{Completion, Executor, Request};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

/// Rough characters per token for the stub's token accounting.
const CHARS_PER_TOKEN: usize = 4;

/// Echoes the prompt after a fixed delay. Token counts are estimated from
/// text length and cost from a flat per-1k-token price.
#[derive(Debug, Clone)]
pub struct StubExecutor {
    latency: Duration,
    usd_per_1k_tokens: f64,
}

impl StubExecutor {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            usd_per_1k_tokens: 0.002,
        }
    }
}

fn estimate_tokens(text: &str) -> u64 {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) as u64
}

#[async_trait]
impl Executor for StubExecutor {
    async fn execute(&self, request: Request) -> Result<Completion> {
        tokio::time::sleep(self.latency).await;

        let content = format!("[{}/{}] {}", request.provider, request.model, request.prompt);
        let input_tokens = estimate_tokens(&request.prompt)
            + request.system_prompt.as_deref().map(estimate_tokens).unwrap_or(0);
        let output_tokens = estimate_tokens(&content);
        let cost = (input_tokens + output_tokens) as f64 / 1000.0 * self.usd_per_1k_tokens;

        Ok(Completion::new(content)
            .with_tokens(input_tokens, output_tokens)
            .with_cost(cost))
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

/// Non-streaming client for an OpenAI-compatible `/v1/chat/completions`.
#[derive(Debug, Clone)]
pub struct OpenAiExecutor {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiExecutor {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(300))
            .build()
            .context("building http client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
        })
    }

    fn body(request: &Request) -> Value {
        let mut messages = Vec::new();
        if let Some(sys) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": sys}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": false,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(user) = &request.user_id {
            body["user"] = json!(user);
        }
        body
    }

    fn parse(raw: ChatCompletion) -> Result<Completion> {
        let Some(choice) = raw.choices.into_iter().next() else {
            bail!("provider returned no choices");
        };
        let usage = raw.usage.unwrap_or_default();
        Ok(Completion::new(choice.message.content.unwrap_or_default())
            .with_tokens(usage.prompt_tokens, usage.completion_tokens))
    }
}

#[async_trait]
impl Executor for OpenAiExecutor {
    async fn execute(&self, request: Request) -> Result<Completion> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut builder = self.http.post(&url).json(&Self::body(&request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(%status, body=%text, request_id=%request.id, "provider returned error");
            bail!("provider returned {status}: {text}");
        }

        let raw: ChatCompletion = resp.json().await?;
        Self::parse(raw)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
