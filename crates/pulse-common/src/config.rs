//! Configuration for the Pulse platform
//!
//! Defaults cover every knob; an optional TOML file and environment
//! variables override them. Environment variables win over the file.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub circuit: CircuitConfig,
    pub scheduler: SchedulerConfig,
    pub pipeline: PipelineConfig,
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub tasks: TaskConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_ms: 30_000,
        }
    }
}

/// Learned-model service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the model service; empty means every request uses the fallback
    pub service_url: String,
    pub request_timeout_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            service_url: String::new(),
            request_timeout_ms: 30_000,
        }
    }
}

impl ModelConfig {
    pub fn service_url(&self) -> Option<&str> {
        if self.service_url.trim().is_empty() {
            None
        } else {
            Some(self.service_url.trim())
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub max_failures: u32,
    pub window_seconds: u64,
    pub cooldown_seconds: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            window_seconds: 300,
            cooldown_seconds: 60,
        }
    }
}

impl CircuitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

/// Periodic scraping schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    /// Fraction of the interval used as jitter bound, in [0, 0.5]
    pub jitter_frac: f64,
    /// Subreddit scraped on the schedule
    pub subreddit: String,
    pub post_limit: u32,
    pub comment_limit_per_post: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            jitter_frac: 0.1,
            subreddit: "ucla".to_string(),
            post_limit: 25,
            comment_limit_per_post: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

/// Pipeline execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Global bound on concurrently running pipelines
    pub max_parallel: usize,
    /// Concurrent classification calls within one persist stage
    pub persist_fanout: usize,
    /// Consecutive store failures that fail the persist stage
    pub store_failure_threshold: u32,
    /// Directory for disk-backed batch files between stages
    pub spool_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            persist_fanout: 8,
            store_failure_threshold: 10,
            spool_dir: std::env::temp_dir().join("pulse-spool"),
        }
    }
}

/// Content source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub page_timeout_ms: u64,
    /// Opaque credentials forwarded to the source (SOURCE_* environment)
    pub credentials: HashMap<String, String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.reddit.com".to_string(),
            page_timeout_ms: 15_000,
            credentials: HashMap::new(),
        }
    }
}

impl SourceConfig {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }
}

/// Result store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dsn: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dsn: "sqlite://pulse.db".to_string(),
        }
    }
}

/// Task registry retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub ttl_hours: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { ttl_hours: 24 }
    }
}

impl TaskConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3600)
    }
}

impl Config {
    /// Load configuration: defaults, then an optional TOML file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| Error::Config(format!("cannot read {}: {}", p.display(), e)))?;
                toml::from_str(&raw)
                    .map_err(|e| Error::Config(format!("cannot parse {}: {}", p.display(), e)))?
            }
            None => Config::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the documented environment variables on top of the current values
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_var("MODEL_SERVICE_URL") {
            self.model.service_url = v;
        }
        if let Some(v) = env_var("CIRCUIT_MAX_FAILURES") {
            self.circuit.max_failures = parse_env("CIRCUIT_MAX_FAILURES", &v)?;
        }
        if let Some(v) = env_var("CIRCUIT_WINDOW_SECONDS") {
            self.circuit.window_seconds = parse_env("CIRCUIT_WINDOW_SECONDS", &v)?;
        }
        if let Some(v) = env_var("CIRCUIT_COOLDOWN_SECONDS") {
            self.circuit.cooldown_seconds = parse_env("CIRCUIT_COOLDOWN_SECONDS", &v)?;
        }
        if let Some(v) = env_var("SCHEDULER_ENABLED") {
            self.scheduler.enabled = parse_bool("SCHEDULER_ENABLED", &v)?;
        }
        if let Some(v) = env_var("SCRAPING_INTERVAL_MINUTES") {
            self.scheduler.interval_minutes = parse_env("SCRAPING_INTERVAL_MINUTES", &v)?;
        }
        if let Some(v) = env_var("SCRAPING_JITTER_FRAC") {
            self.scheduler.jitter_frac = parse_env("SCRAPING_JITTER_FRAC", &v)?;
        }
        if let Some(v) = env_var("PIPELINE_MAX_PARALLEL") {
            self.pipeline.max_parallel = parse_env("PIPELINE_MAX_PARALLEL", &v)?;
        }
        if let Some(v) = env_var("PIPELINE_PERSIST_FANOUT") {
            self.pipeline.persist_fanout = parse_env("PIPELINE_PERSIST_FANOUT", &v)?;
        }
        if let Some(v) = env_var("STORE_DSN") {
            self.store.dsn = v;
        }
        if let Some(v) = env_var("TASK_TTL_HOURS") {
            self.tasks.ttl_hours = parse_env("TASK_TTL_HOURS", &v)?;
        }
        // SOURCE_* credentials are forwarded opaquely
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix("SOURCE_") {
                if !name.is_empty() {
                    self.source
                        .credentials
                        .insert(name.to_ascii_lowercase(), value);
                }
            }
        }
        Ok(())
    }

    /// Fail-fast sanity checks; violations are fatal at startup
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=0.5).contains(&self.scheduler.jitter_frac) {
            return Err(Error::Config(format!(
                "scheduler.jitter_frac must be in [0, 0.5], got {}",
                self.scheduler.jitter_frac
            )));
        }
        if self.circuit.max_failures == 0 {
            return Err(Error::Config("circuit.max_failures must be >= 1".into()));
        }
        if self.pipeline.max_parallel == 0 {
            return Err(Error::Config("pipeline.max_parallel must be >= 1".into()));
        }
        if self.pipeline.persist_fanout == 0 {
            return Err(Error::Config("pipeline.persist_fanout must be >= 1".into()));
        }
        if self.scheduler.enabled && self.scheduler.interval_minutes == 0 {
            return Err(Error::Config(
                "scheduler.interval_minutes must be >= 1 when the scheduler is enabled".into(),
            ));
        }
        if self.store.dsn.trim().is_empty() {
            return Err(Error::Config("store.dsn must not be empty".into()));
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Config(format!("invalid {}={:?}: {}", name, value, e)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("invalid {}={:?}", name, other))),
    }
}
