use serde::{Deserialize, Serialize};

use crate::retry::{Backoff, RetryConfig};

/// Daemon runtime configuration, loaded from `SKYFLOW_*` environment
/// variables (with unprefixed fallbacks) after `.env`.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub store_root: String,
    pub worker_id: String,
    pub slots: usize,
    pub lease_seconds: i64,
    pub dequeue_batch_size: usize,
    pub reap_interval_ms: u64,
    pub tick_interval_ms: u64,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_or_fallback("SKYFLOW_DATABASE_URL", "DATABASE_URL");

        let store_root = env_or_fallback("SKYFLOW_STORE_ROOT", "STORE_ROOT")
            .unwrap_or_else(|| "./skyflow-data".to_string());

        let worker_id = env_or_fallback("SKYFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let slots = env_or_fallback("SKYFLOW_SLOTS", "SLOTS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        let lease_seconds = env_or_fallback("SKYFLOW_LEASE_SECONDS", "LEASE_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let dequeue_batch_size = env_or_fallback("SKYFLOW_DEQUEUE_BATCH_SIZE", "DEQUEUE_BATCH_SIZE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let reap_interval_ms = env_or_fallback("SKYFLOW_REAP_INTERVAL_MS", "REAP_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);

        let tick_interval_ms = env_or_fallback("SKYFLOW_TICK_INTERVAL_MS", "TICK_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1_000);

        let admin_addr = env_or_fallback("SKYFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("SKYFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        Ok(Self {
            database_url,
            store_root,
            worker_id,
            slots,
            lease_seconds,
            dequeue_batch_size,
            reap_interval_ms,
            tick_interval_ms,
            admin_addr,
            migrate_on_startup,
        })
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

// ----------------------------
// Declarative job config
// ----------------------------

/// A submitted job, as read from the `--config` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub handler_ref: String,
    pub input: InputSpec,
    #[serde(default)]
    pub compute: ComputeSpec,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default)]
    pub retry: RetrySpec,
    /// Handler-specific payload: any top-level field the schema above does
    /// not name rides along verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    /// Partitioner selector: "file", "rows", or "key-hash".
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub file_pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeSpec {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: u64,
    #[serde(default = "default_runtime_budget_secs")]
    pub runtime_budget_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub partition_keys: Option<Vec<String>>,
    #[serde(default = "default_write_mode")]
    pub write_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    #[serde(default = "default_max_retry_phases")]
    pub max_retry_phases: u32,
    #[serde(default = "default_backoff")]
    pub backoff: Backoff,
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
}

fn default_format() -> String {
    "jsonl".to_string()
}
fn default_batch_size() -> usize {
    1_000
}
fn default_max_concurrency() -> usize {
    4
}
fn default_memory_budget_mb() -> u64 {
    512
}
fn default_runtime_budget_secs() -> u64 {
    3_600
}
fn default_compression() -> String {
    "none".to_string()
}
fn default_write_mode() -> String {
    "create".to_string()
}
fn default_max_retry_phases() -> u32 {
    2
}
fn default_backoff() -> Backoff {
    Backoff::Exponential
}
fn default_initial_ms() -> u64 {
    500
}
fn default_cap_ms() -> u64 {
    60_000
}

impl Default for ComputeSpec {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            memory_budget_mb: default_memory_budget_mb(),
            runtime_budget_secs: default_runtime_budget_secs(),
        }
    }
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            format: default_format(),
            compression: default_compression(),
            destination: String::new(),
            partition_keys: None,
            write_mode: default_write_mode(),
        }
    }
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_retry_phases: default_max_retry_phases(),
            backoff: default_backoff(),
            initial_ms: default_initial_ms(),
            cap_ms: default_cap_ms(),
        }
    }
}

impl JobSpec {
    pub fn from_json(raw: &str) -> Result<Self, String> {
        let spec: JobSpec = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, String> {
        let spec: JobSpec = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if self.handler_ref.trim().is_empty() {
            return Err("handler_ref must not be empty".to_string());
        }
        if !matches!(self.input.kind.as_str(), "file" | "rows" | "key-hash") {
            return Err(format!("unknown input.type {:?}", self.input.kind));
        }
        if self.input.path.trim().is_empty() {
            return Err("input.path must not be empty".to_string());
        }
        if self.input.batch_size == 0 {
            return Err("input.batch_size must be positive".to_string());
        }
        Ok(())
    }

    /// Per-job retry knobs merged over the runtime defaults.
    pub fn retry_config(&self, base: &RetryConfig) -> RetryConfig {
        RetryConfig {
            max_retry_phases: self.retry.max_retry_phases,
            backoff: self.retry.backoff,
            initial_ms: self.retry.initial_ms,
            cap_ms: self.retry.cap_ms,
            ..base.clone()
        }
    }
}
