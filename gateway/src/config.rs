use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError as ConfigCrateError, Environment, File};
use serde::Deserialize;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

/// Scheduler tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Heartbeat silence after which a worker is declared lost.
    #[serde(default = "default_liveness_threshold_secs")]
    pub liveness_threshold_secs: u64,
    /// Interval between liveness/deadline sweeps.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Total dispatch attempts per job before a worker loss is final.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Bound on the worker-side cancel signal when a job is cancelled.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Maximum queued jobs across all priorities.
    #[serde(default = "default_queue_depth_limit")]
    pub queue_depth_limit: usize,
    /// Default job timeout when the request does not carry one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_cors_origins")]
    pub origins: String,
}

// Defaults
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_liveness_threshold_secs() -> u64 {
    30
}
fn default_sweep_interval_ms() -> u64 {
    500
}
fn default_max_attempts() -> u32 {
    3
}
fn default_cancel_grace_ms() -> u64 {
    2000
}
fn default_queue_depth_limit() -> usize {
    1024
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_cors_origins() -> String {
    "*".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            liveness_threshold_secs: default_liveness_threshold_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_attempts: default_max_attempts(),
            cancel_grace_ms: default_cancel_grace_ms(),
            queue_depth_limit: default_queue_depth_limit(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: default_cors_origins(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_secs(self.liveness_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn default_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_timeout_secs as i64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    LoadError(String),
}

impl From<ConfigCrateError> for ConfigError {
    fn from(err: ConfigCrateError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

impl Config {
    /// Load configuration from config.toml (if exists) and environment variables.
    /// Environment variables override file settings.
    /// Env var format: FLEET__SECTION__KEY (e.g., FLEET__SCHEDULER__MAX_ATTEMPTS)
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("host", default_host())?
            .set_default("port", default_port() as i64)?
            .set_default(
                "scheduler.liveness_threshold_secs",
                default_liveness_threshold_secs() as i64,
            )?
            .set_default(
                "scheduler.sweep_interval_ms",
                default_sweep_interval_ms() as i64,
            )?
            .set_default("scheduler.max_attempts", default_max_attempts() as i64)?
            .set_default("scheduler.cancel_grace_ms", default_cancel_grace_ms() as i64)?
            .set_default(
                "scheduler.queue_depth_limit",
                default_queue_depth_limit() as i64,
            )?
            .set_default("scheduler.default_timeout_secs", default_timeout_secs() as i64)?
            .set_default("logging.level", default_log_level())?
            .set_default("cors.origins", default_cors_origins())?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("FLEET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(ConfigError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_host() {
        assert_eq!(default_host(), "0.0.0.0");
    }

    #[test]
    fn test_default_port() {
        assert_eq!(default_port(), 8080);
    }

    #[test]
    fn test_scheduler_defaults() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.liveness_threshold_secs, 30);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.queue_depth_limit, 1024);
        assert_eq!(cfg.default_timeout_secs, 300);
    }

    #[test]
    fn test_scheduler_durations() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.liveness_threshold(), Duration::from_secs(30));
        assert_eq!(cfg.sweep_interval(), Duration::from_millis(500));
        assert_eq!(cfg.cancel_grace(), Duration::from_millis(2000));
        assert_eq!(cfg.default_timeout(), chrono::Duration::seconds(300));
    }

    #[test]
    fn test_logging_config_defaults() {
        assert_eq!(LoggingConfig::default().level, "info");
    }

    #[test]
    fn test_cors_config_defaults() {
        assert_eq!(CorsConfig::default().origins, "*");
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::LoadError("bad value".to_string());
        assert!(error.to_string().contains("Configuration error"));
    }
}
