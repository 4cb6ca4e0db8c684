use std::fmt;
use std::sync::LazyLock;

use aigate_common::Request;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Polite preambles that carry no instruction for the model.
static LEADING_FILLER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:(?:please|kindly)[,:]?\s+|(?:could|can|would|will) you(?: please| kindly)?[,:]?\s+|i (?:would like|want|need) you to\s+)+",
    )
    .expect("invalid leading filler regex")
});

static TRAILING_FILLER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[\s,]*(?:thanks|thank you)(?: so much| very much)? in advance[.!]*$")
        .expect("invalid trailing filler regex")
});

/// Characters per token used for savings estimates.
const CHARS_PER_TOKEN: usize = 4;

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// A request whose prompt went through [`normalize`].
#[derive(Debug, Clone)]
pub struct Normalized {
    pub request: Request,
    pub chars_removed: usize,
}

impl Normalized {
    /// Rough token savings from prompt shrinkage. Observability only.
    pub fn estimated_tokens_saved(&self) -> u64 {
        (self.chars_removed / CHARS_PER_TOKEN) as u64
    }
}

/// Collapse whitespace in the prompt and strip filler phrases at its edges.
///
/// Only the prompt changes. System prompt, sampling parameters and routing
/// fields are copied as-is. A prompt made of filler alone keeps its
/// whitespace-collapsed form instead of becoming empty.
pub fn normalize(request: &Request) -> Normalized {
    let collapsed = collapse_whitespace(&request.prompt);
    let stripped = strip_filler(&collapsed);
    let prompt = if stripped.is_empty() { collapsed } else { stripped };

    let chars_removed = request
        .prompt
        .chars()
        .count()
        .saturating_sub(prompt.chars().count());

    let mut normalized = request.clone();
    normalized.prompt = prompt;
    Normalized {
        request: normalized,
        chars_removed,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_filler(text: &str) -> String {
    let text = LEADING_FILLER.replace(text, "");
    let text = TRAILING_FILLER.replace(&text, "");
    text.trim().to_string()
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Hex SHA-256 over the cache and dedup relevant fields of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint an already-normalized request.
///
/// Covers provider, model, prompt, system prompt, max tokens and temperature.
/// Id, priority, owner ids and the cacheable flag are ignored. No salt is
/// mixed in, so the value is stable across processes.
///
/// Each field is written as a presence byte, a little-endian u64 length and
/// the raw bytes, so no field content can spill into its neighbour and an
/// absent optional differs from an empty one.
pub fn fingerprint(request: &Request) -> Fingerprint {
    let max_tokens = request.max_tokens.map(|v| v.to_string());
    let temperature = request.temperature.map(|v| v.to_string());

    let mut hasher = Sha256::new();
    for field in [
        Some(request.provider.as_str()),
        Some(request.model.as_str()),
        Some(request.prompt.as_str()),
        request.system_prompt.as_deref(),
        max_tokens.as_deref(),
        temperature.as_deref(),
    ] {
        hash_field(&mut hasher, field);
    }
    Fingerprint(format!("{:x}", hasher.finalize()))
}

fn hash_field(hasher: &mut Sha256, field: Option<&str>) {
    match field {
        Some(value) => {
            hasher.update([1u8]);
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        None => hasher.update([0u8]),
    }
}
