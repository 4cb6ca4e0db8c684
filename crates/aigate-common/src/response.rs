use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What an executor reports back after a provider call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Completion {
    pub content: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Provider cost in USD.
    #[serde(default)]
    pub cost: f64,
}

impl Completion {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// The answer handed back to a caller of `submit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Id of the request this response answers.
    pub id: String,
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    /// Served from the response cache without running an executor.
    #[serde(default)]
    pub cached: bool,
    /// Received by joining another request's in-flight execution.
    #[serde(default)]
    pub deduplicated: bool,
    /// Wall-clock time, in milliseconds, from submit to answer.
    #[serde(default)]
    pub duration_ms: u64,
}

impl Response {
    pub fn from_completion(id: impl Into<String>, completion: Completion, duration: Duration) -> Self {
        Self {
            id: id.into(),
            content: completion.content,
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            cost: completion.cost,
            cached: false,
            deduplicated: false,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}
