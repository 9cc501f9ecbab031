use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid env var {name}: {value:?}")]
    InvalidEnv { name: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// JSON file holding every target definition.
    #[serde(default = "default_targets_file")]
    pub targets_file: PathBuf,
    /// Root for per-target worker output directories.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Worker executable.
    #[serde(default = "default_worker_program")]
    pub worker_program: String,
    /// Arguments placed before `<url> <output_dir>`.
    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,
    /// Batch tick period in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Activation sweep period in milliseconds.
    #[serde(default = "default_activation_sweep_ms")]
    pub activation_sweep_ms: u64,
    /// Per-invocation deadline.
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    /// Time allowed for a killed worker to be reaped.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Max worker processes per batch.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// intervalMs for targets added without one.
    #[serde(default = "default_interval_ms")]
    pub default_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    /// Send change notices to the webhook (changes are always logged).
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_targets_file() -> PathBuf {
    PathBuf::from("urls-config.json")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_worker_program() -> String {
    "node".to_string()
}
fn default_worker_args() -> Vec<String> {
    vec!["unified-process.js".to_string()]
}
fn default_tick_ms() -> u64 {
    1000
}
fn default_activation_sweep_ms() -> u64 {
    10_000
}
fn default_worker_timeout_secs() -> u64 {
    120
}
fn default_kill_grace_ms() -> u64 {
    2000
}
fn default_max_concurrent() -> usize {
    10
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            targets_file: default_targets_file(),
            output_dir: default_output_dir(),
            worker_program: default_worker_program(),
            worker_args: default_worker_args(),
            tick_ms: default_tick_ms(),
            activation_sweep_ms: default_activation_sweep_ms(),
            worker_timeout_secs: default_worker_timeout_secs(),
            kill_grace_ms: default_kill_grace_ms(),
            max_concurrent: default_max_concurrent(),
            default_interval_ms: default_interval_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// `load` when `path` exists, otherwise `from_env`. Errors in an existing
    /// file are returned, never papered over with defaults.
    pub fn load_or_env(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::from_env()
        }
    }

    /// Defaults plus environment overrides (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Overlay environment-style overrides. `lookup` is injectable for tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("API_PORT") {
            let port: u16 = parse_env("API_PORT", &port)?;
            self.api.bind = format!("0.0.0.0:{port}");
        }
        if let Some(bind) = lookup("ODDSWATCH_BIND") {
            self.api.bind = bind;
        }
        if let Some(flag) = lookup("ENABLE_NOTIFICATIONS") {
            self.notify.enabled = flag.eq_ignore_ascii_case("true") || flag == "1";
        }
        if let Some(url) = lookup("NOTIFY_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
        if let Some(program) = lookup("WORKER_PROGRAM") {
            self.monitor.worker_program = program;
        }
        if let Some(path) = lookup("TARGETS_FILE") {
            self.monitor.targets_file = PathBuf::from(path);
        }
        if let Some(path) = lookup("OUTPUT_DIR") {
            self.monitor.output_dir = PathBuf::from(path);
        }
        if let Some(v) = lookup("MAX_CONCURRENT") {
            self.monitor.max_concurrent = parse_env("MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = lookup("TICK_MS") {
            self.monitor.tick_ms = parse_env("TICK_MS", &v)?;
        }
        if let Some(v) = lookup("WORKER_TIMEOUT_SECS") {
            self.monitor.worker_timeout_secs = parse_env("WORKER_TIMEOUT_SECS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.monitor;
        let checks = [
            (m.tick_ms == 0, "monitor.tick_ms must be > 0"),
            (m.activation_sweep_ms == 0, "monitor.activation_sweep_ms must be > 0"),
            (m.worker_timeout_secs == 0, "monitor.worker_timeout_secs must be > 0"),
            (m.max_concurrent == 0, "monitor.max_concurrent must be > 0"),
            (m.default_interval_ms == 0, "monitor.default_interval_ms must be > 0"),
            (m.worker_program.trim().is_empty(), "monitor.worker_program is empty"),
        ];
        if let Some((_, msg)) = checks.iter().find(|(bad, _)| *bad) {
            return Err(ConfigError::Invalid(msg.to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    })
}
