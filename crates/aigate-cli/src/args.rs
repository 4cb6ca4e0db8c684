use aigate_common::config::parse_rate_limits;
use aigate_common::telemetry::LogFormat;
use aigate_common::{EngineConfig, Priority};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "aigate")]
#[command(about = "Admission, caching and dedup in front of AI providers", long_about = None)]
pub struct Args {
    /// Log output format: text or json
    #[arg(long, env = "AIGATE_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// OTLP/HTTP endpoint for exporting traces
    #[arg(long, env = "AIGATE_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP collector
    #[arg(long, env = "AIGATE_OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    /// etcd endpoints for the response cache; in-memory cache when empty
    #[arg(long, env = "AIGATE_ETCD_ENDPOINTS", value_delimiter = ',')]
    pub etcd_endpoints: Vec<String>,

    #[arg(long, env = "AIGATE_MAX_CONCURRENCY")]
    pub max_concurrency: Option<usize>,

    #[arg(long, env = "AIGATE_TICK_MS")]
    pub tick_ms: Option<u64>,

    /// Default time a request may wait for admission
    #[arg(long, env = "AIGATE_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    #[arg(long, env = "AIGATE_CACHE_TTL_MS")]
    pub cache_ttl_ms: Option<u64>,

    /// Per-provider limits as provider:per_minute:burst (repeatable)
    #[arg(long = "rate-limit", env = "AIGATE_RATE_LIMITS", value_delimiter = ',')]
    pub rate_limits: Vec<String>,

    #[arg(long, env = "AIGATE_EXECUTOR", value_enum, default_value_t = ExecutorKind::Stub)]
    pub executor: ExecutorKind,

    /// Simulated provider latency for the stub executor
    #[arg(long, env = "AIGATE_STUB_LATENCY_MS", default_value_t = 200)]
    pub stub_latency_ms: u64,

    #[arg(long, env = "AIGATE_OPENAI_BASE_URL", default_value = "https://api.openai.com")]
    pub openai_base_url: String,

    #[arg(long, env = "AIGATE_OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutorKind {
    /// Echo the prompt after a fixed delay
    Stub,
    /// OpenAI-compatible chat completions endpoint
    Openai,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit prompts through the engine and print the responses
    Run {
        /// Prompts to submit concurrently
        #[arg(required = true)]
        prompts: Vec<String>,

        #[command(flatten)]
        target: Target,

        #[arg(long)]
        system: Option<String>,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long, default_value_t = Priority::Normal)]
        priority: Priority,

        /// Skip the response cache for these prompts
        #[arg(long)]
        no_cache: bool,

        /// Print responses as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Fire a synthetic workload and report queue and optimization stats
    Bench {
        #[command(flatten)]
        target: Target,

        /// Total requests to submit
        #[arg(long, default_value_t = 50)]
        requests: usize,

        /// Distinct prompts among them
        #[arg(long, default_value_t = 10)]
        unique: usize,

        /// Every Nth request is high priority (0 disables)
        #[arg(long, default_value_t = 0)]
        high_every: usize,

        /// Print Prometheus metrics instead of tables
        #[arg(long)]
        metrics: bool,
    },
    /// Print the effective engine configuration
    Config,
}

#[derive(Debug, Clone, clap::Args)]
pub struct Target {
    #[arg(long, default_value = "openai")]
    pub provider: String,

    #[arg(long, default_value = "gpt-4o-mini")]
    pub model: String,
}

impl Args {
    /// Engine configuration from `AIGATE_*` variables with flags layered on top.
    pub fn engine_config(&self) -> EngineConfig {
        let mut cfg = EngineConfig::from_env();
        if let Some(v) = self.max_concurrency {
            cfg.max_concurrency = v.max(1);
        }
        if let Some(v) = self.tick_ms {
            cfg.tick_interval_ms = v.max(1);
        }
        if let Some(v) = self.timeout_ms {
            cfg.default_timeout_ms = v;
        }
        if let Some(v) = self.cache_ttl_ms {
            cfg.cache_ttl_ms = v;
        }
        if !self.rate_limits.is_empty() {
            cfg.rate_limits
                .extend(parse_rate_limits(&self.rate_limits.join(",")));
        }
        cfg
    }
}
