use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// DeploymentMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    SelfHosted,
    Hosted,
}

impl DeploymentMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "self_hosted" => Some(DeploymentMode::SelfHosted),
            "hosted" => Some(DeploymentMode::Hosted),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ModelPrice
// ---------------------------------------------------------------------------

/// Per-model pricing, supplied by the operator. The completion layer turns
/// token usage into cents with this table; unknown models price at zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model: String,
    pub input_cents_per_1k: f64,
    pub output_cents_per_1k: f64,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Runtime configuration, resolved from the environment.
///
/// Recognized variables: `DATABASE_PATH`, `WORKSPACES_ROOT`, `BACKEND_BIND`,
/// `MAX_CONCURRENT_AGENTS`, `TASK_TIMEOUT_SEC`, `SESSION_TIMEOUT_SEC`,
/// `WATCHDOG_MAX`, `DEPLOYMENT_MODE`, `PROVIDER_API_KEY`,
/// `SUBSCRIBER_QUEUE_SIZE`, `API_TOKEN`, `MODEL_PRICES` (JSON array of
/// [`ModelPrice`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_path: PathBuf,
    pub workspaces_root: PathBuf,
    pub backend_bind: String,
    pub max_concurrent_agents: usize,
    pub task_timeout_sec: u64,
    pub session_timeout_sec: u64,
    pub watchdog_max: u64,
    pub deployment_mode: DeploymentMode,
    pub provider_api_key: Option<String>,
    pub subscriber_queue_size: usize,
    /// Consecutive overflow ticks before a slow subscriber is dropped.
    pub subscriber_eviction_ticks: u32,
    /// Upper bound on discovery questions per project.
    pub max_discovery_questions: usize,
    /// Grace window before a paused session force-abandons in-flight work.
    pub pause_grace_ms: u64,
    /// Bearer token required by the HTTP surface. `None` = development mode.
    pub api_token: Option<String>,
    pub model_prices: Vec<ModelPrice>,
    /// Model identifier passed to the completion provider.
    pub default_model: String,
    /// Completion budget per call.
    pub max_completion_tokens: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("codeframe.db"),
            workspaces_root: PathBuf::from("workspaces"),
            backend_bind: "127.0.0.1:8080".into(),
            max_concurrent_agents: 5,
            task_timeout_sec: 600,
            session_timeout_sec: 7200,
            watchdog_max: 1000,
            deployment_mode: DeploymentMode::SelfHosted,
            provider_api_key: None,
            subscriber_queue_size: 256,
            subscriber_eviction_ticks: 3,
            max_discovery_questions: 12,
            pause_grace_ms: 15_000,
            api_token: None,
            model_prices: Vec::new(),
            default_model: "sonnet".into(),
            max_completion_tokens: 8192,
        }
    }
}

impl Config {
    /// Resolve configuration from the process environment, falling back to
    /// defaults for anything unset. Malformed numeric values fall back with
    /// a warning rather than aborting startup.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(v) = std::env::var("DATABASE_PATH") {
            cfg.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("WORKSPACES_ROOT") {
            cfg.workspaces_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BACKEND_BIND") {
            cfg.backend_bind = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_CONCURRENT_AGENTS") {
            cfg.max_concurrent_agents = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("TASK_TIMEOUT_SEC") {
            cfg.task_timeout_sec = v;
        }
        if let Some(v) = env_parse::<u64>("SESSION_TIMEOUT_SEC") {
            cfg.session_timeout_sec = v;
        }
        if let Some(v) = env_parse::<u64>("WATCHDOG_MAX") {
            cfg.watchdog_max = v;
        }
        if let Ok(v) = std::env::var("DEPLOYMENT_MODE") {
            match DeploymentMode::parse(&v) {
                Some(mode) => cfg.deployment_mode = mode,
                None => tracing::warn!(value = %v, "unrecognized DEPLOYMENT_MODE, keeping default"),
            }
        }
        if let Ok(v) = std::env::var("PROVIDER_API_KEY") {
            if !v.is_empty() {
                cfg.provider_api_key = Some(v);
            }
        }
        if let Some(v) = env_parse::<usize>("SUBSCRIBER_QUEUE_SIZE") {
            cfg.subscriber_queue_size = v.max(1);
        }
        if let Ok(v) = std::env::var("API_TOKEN") {
            if !v.is_empty() {
                cfg.api_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("PROVIDER_MODEL") {
            if !v.is_empty() {
                cfg.default_model = v;
            }
        }
        if let Some(v) = env_parse::<u32>("MAX_COMPLETION_TOKENS") {
            cfg.max_completion_tokens = v.max(1);
        }
        if let Ok(v) = std::env::var("MODEL_PRICES") {
            match serde_json::from_str::<Vec<ModelPrice>>(&v) {
                Ok(prices) => cfg.model_prices = prices,
                Err(e) => tracing::warn!(error = %e, "failed to parse MODEL_PRICES, pricing disabled"),
            }
        }

        cfg
    }

    pub fn task_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.task_timeout_sec)
    }

    pub fn session_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.session_timeout_sec)
    }

    pub fn pause_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.pause_grace_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "malformed numeric env var, keeping default");
                None
            }
        },
        Err(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
