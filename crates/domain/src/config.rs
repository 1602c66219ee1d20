//! Environment-driven configuration.
//!
//! All knobs are read once at startup by [`Config::from_env`]. Parse
//! failures abort startup with a descriptive error rather than falling
//! back silently.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// Fallback context window when a model has no entry in `LLM_TOKEN_BUDGETS`.
pub const DEFAULT_TOKEN_BUDGET: u32 = 128_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub runtime: RuntimeConfig,
    pub context: ContextConfig,
    /// Address of the key-value substrate backing the fabric and status
    /// registry. `None` selects the in-process store.
    pub kv_url: Option<String>,
    /// External data provider for the `web_search` tool. `None` leaves
    /// the tool registered but unavailable.
    pub search_provider_url: Option<String>,
    /// Directory for JSONL thread logs. `None` keeps messages in memory.
    pub state_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Bearer token for the `/agent` routes. `None` = dev mode, no auth.
    pub api_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
    /// Per-model context budgets, `model=tokens` pairs.
    pub token_budgets: HashMap<String, u32>,
    /// Maximum gap between streamed tokens before the call is abandoned.
    pub stream_idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub provider_url: String,
    pub api_key: String,
    pub provision_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub worker_pool_size: usize,
    pub admission_timeout: Duration,
    pub response_list_ttl: Duration,
    pub status_ttl: Duration,
    pub tool_timeout: Duration,
    pub max_auto_continues: usize,
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Compaction triggers above `threshold_ratio × budget`.
    pub threshold_ratio: f64,
    /// Compaction keeps the newest messages up to `target_ratio × budget`.
    pub target_ratio: f64,
    /// Character-per-token divisor for the estimation heuristic.
    pub chars_per_token: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1:8080".into(), api_token: None }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".into(),
            default_model: "gpt-4o".into(),
            token_budgets: HashMap::new(),
            stream_idle_timeout: Duration::from_secs(120),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider_url: String::new(),
            api_key: String::new(),
            provision_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            admission_timeout: Duration::from_secs(60),
            response_list_ttl: Duration::from_secs(24 * 60 * 60),
            status_ttl: Duration::from_secs(60 * 60),
            tool_timeout: Duration::from_secs(60),
            max_auto_continues: 25,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { threshold_ratio: 0.75, target_ratio: 0.40, chars_per_token: 4 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            sandbox: SandboxConfig::default(),
            runtime: RuntimeConfig::default(),
            context: ContextConfig::default(),
            kv_url: None,
            search_provider_url: None,
            state_dir: None,
        }
    }
}

/// CPU cores × 4, capped. One worker task per active run.
fn default_worker_pool_size() -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    (cores * 4).min(64)
}

impl Config {
    /// Read the full configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();

        if let Some(v) = env_opt("RELAY_BIND_ADDR") {
            cfg.server.bind_addr = v;
        }
        cfg.server.api_token = env_opt("RELAY_API_TOKEN");

        if let Some(v) = env_opt("LLM_API_KEY") {
            cfg.llm.api_key = v;
        }
        if let Some(v) = env_opt("LLM_BASE_URL") {
            cfg.llm.base_url = v;
        }
        if let Some(v) = env_opt("LLM_DEFAULT_MODEL") {
            cfg.llm.default_model = v;
        }
        if let Some(v) = env_opt("LLM_TOKEN_BUDGETS") {
            cfg.llm.token_budgets = parse_token_budgets(&v)?;
        }
        if let Some(v) = env_opt("LLM_STREAM_IDLE_TIMEOUT_SECONDS") {
            cfg.llm.stream_idle_timeout = Duration::from_secs(parse_num("LLM_STREAM_IDLE_TIMEOUT_SECONDS", &v)?);
        }

        cfg.kv_url = env_opt("KV_URL");
        cfg.search_provider_url = env_opt("SEARCH_PROVIDER_URL");
        cfg.state_dir = env_opt("RELAY_STATE_DIR");

        if let Some(v) = env_opt("SANDBOX_PROVIDER_URL") {
            cfg.sandbox.provider_url = v;
        }
        if let Some(v) = env_opt("SANDBOX_API_KEY") {
            cfg.sandbox.api_key = v;
        }

        if let Some(v) = env_opt("RUN_WORKER_POOL_SIZE") {
            let n: usize = parse_num("RUN_WORKER_POOL_SIZE", &v)?;
            if n == 0 {
                return Err(Error::InvalidRequest("RUN_WORKER_POOL_SIZE must be ≥ 1".into()));
            }
            cfg.runtime.worker_pool_size = n;
        }
        if let Some(v) = env_opt("ADMISSION_TIMEOUT_SECONDS") {
            cfg.runtime.admission_timeout = Duration::from_secs(parse_num("ADMISSION_TIMEOUT_SECONDS", &v)?);
        }
        if let Some(v) = env_opt("RESPONSE_LIST_TTL_SECONDS") {
            cfg.runtime.response_list_ttl = Duration::from_secs(parse_num("RESPONSE_LIST_TTL_SECONDS", &v)?);
        }
        if let Some(v) = env_opt("STATUS_TTL_SECONDS") {
            cfg.runtime.status_ttl = Duration::from_secs(parse_num("STATUS_TTL_SECONDS", &v)?);
        }
        if let Some(v) = env_opt("TOOL_TIMEOUT_SECONDS") {
            cfg.runtime.tool_timeout = Duration::from_secs(parse_num("TOOL_TIMEOUT_SECONDS", &v)?);
        }
        if let Some(v) = env_opt("MAX_AUTO_CONTINUES") {
            cfg.runtime.max_auto_continues = parse_num("MAX_AUTO_CONTINUES", &v)?;
        }

        if let Some(v) = env_opt("CONTEXT_THRESHOLD_RATIO") {
            cfg.context.threshold_ratio = parse_ratio("CONTEXT_THRESHOLD_RATIO", &v)?;
        }
        if let Some(v) = env_opt("CONTEXT_TARGET_RATIO") {
            cfg.context.target_ratio = parse_ratio("CONTEXT_TARGET_RATIO", &v)?;
        }

        Ok(cfg)
    }

    /// Context budget for a model: exact entry, longest prefix entry
    /// (model family), then the global default.
    pub fn token_budget(&self, model: &str) -> u32 {
        if let Some(&b) = self.llm.token_budgets.get(model) {
            return b;
        }
        self.llm
            .token_budgets
            .iter()
            .filter(|(family, _)| model.starts_with(family.as_str()))
            .max_by_key(|(family, _)| family.len())
            .map(|(_, &b)| b)
            .unwrap_or(DEFAULT_TOKEN_BUDGET)
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_num<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| Error::InvalidRequest(format!("{name}={raw:?}: {e}")))
}

fn parse_ratio(name: &str, raw: &str) -> Result<f64> {
    let v: f64 = parse_num(name, raw)?;
    if !(0.0..=1.0).contains(&v) {
        return Err(Error::InvalidRequest(format!("{name} must be in [0, 1], got {v}")));
    }
    Ok(v)
}

/// Parse `model=tokens` comma-separated pairs, e.g.
/// `gpt-4o=128000,claude-sonnet=200000`.
fn parse_token_budgets(raw: &str) -> Result<HashMap<String, u32>> {
    let mut map = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (model, budget) = pair
            .split_once('=')
            .ok_or_else(|| Error::InvalidRequest(format!("LLM_TOKEN_BUDGETS entry {pair:?} is not model=tokens")))?;
        let budget: u32 = parse_num("LLM_TOKEN_BUDGETS", budget)?;
        map.insert(model.trim().to_owned(), budget);
    }
    Ok(map)
}
