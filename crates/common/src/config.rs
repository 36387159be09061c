use crate::models::SourceConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use validator::Validate;

// Default constants
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_SERVER_NAME: &str = "sluice";

pub const DEFAULT_MAX_CONCURRENT_QUERIES: usize = 10;
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 100;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 5;
pub const DEFAULT_DISPATCH_PULL_LIMIT: usize = 10;
pub const DEFAULT_BATCHING_EFFICIENCY: f64 = 0.7;
pub const DEFAULT_STATS_CAPACITY: usize = 10_000;
pub const DEFAULT_STATS_TTL_SECS: u64 = 3600;
pub const DEFAULT_HOST_SAMPLE_INTERVAL_MS: u64 = 1000;

pub const DEFAULT_CPU_THRESHOLD: f64 = 0.80;
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 0.85;
pub const DEFAULT_CONNECTION_THRESHOLD: f64 = 0.80;

pub const DEFAULT_MONITOR_WINDOW: usize = 100;
pub const DEFAULT_ERROR_WINDOW_SECS: u64 = 60;
pub const DEFAULT_CRITICAL_ERROR_COUNT: usize = 10;
pub const DEFAULT_HIGH_LATENCY_SECS: f64 = 5.0;
pub const DEFAULT_MEDIUM_LATENCY_SECS: f64 = 2.0;

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

pub const DEFAULT_TELEMETRY_ENABLED: bool = false;
pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

#[derive(Debug, Deserialize, Serialize, Default, Clone, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerSettings,
    #[serde(default)]
    #[validate(nested)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    #[validate(nested)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    #[validate(nested)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheSettings,
    #[serde(default)]
    #[validate(nested)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct ServerSettings {
    #[serde(default = "default_listen_addr")]
    #[validate(length(min = 1))]
    pub listen_addr: String,

    #[serde(default = "default_server_name")]
    pub name: String,

    /// Source used by the server's query executor.
    #[serde(default)]
    pub default_source: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            name: default_server_name(),
            default_source: None,
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_server_name() -> String {
    DEFAULT_SERVER_NAME.to_string()
}

/// Host and connection-slot utilization ceilings for admitting new work.
///
/// Values are fractions in `(0, 1]`; admission requires usage strictly below each.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Validate)]
pub struct AdmissionThresholds {
    #[serde(default = "default_cpu_threshold")]
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub cpu: f64,
    #[serde(default = "default_memory_threshold")]
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub memory: f64,
    #[serde(default = "default_connection_threshold")]
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub connections: f64,
}

impl Default for AdmissionThresholds {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_CPU_THRESHOLD,
            memory: DEFAULT_MEMORY_THRESHOLD,
            connections: DEFAULT_CONNECTION_THRESHOLD,
        }
    }
}

fn default_cpu_threshold() -> f64 {
    DEFAULT_CPU_THRESHOLD
}
fn default_memory_threshold() -> f64 {
    DEFAULT_MEMORY_THRESHOLD
}
fn default_connection_threshold() -> f64 {
    DEFAULT_CONNECTION_THRESHOLD
}

#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct SchedulerSettings {
    #[serde(default = "default_max_concurrent_queries")]
    #[validate(range(min = 1))]
    pub max_concurrent_queries: usize,

    /// Dispatch loop cadence.
    #[serde(default = "default_batch_window_ms")]
    #[validate(range(min = 1))]
    pub batch_window_ms: u64,

    #[serde(default = "default_max_batch_size")]
    #[validate(range(min = 2, max = 5))]
    pub max_batch_size: usize,

    /// Requests pulled from one priority queue per tick.
    #[serde(default = "default_dispatch_pull_limit")]
    #[validate(range(min = 1))]
    pub dispatch_pull_limit: usize,

    /// Discount applied to the summed estimate of a batch.
    #[serde(default = "default_batching_efficiency")]
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub batching_efficiency: f64,

    #[serde(default = "default_stats_capacity")]
    #[validate(range(min = 1))]
    pub stats_capacity: usize,

    #[serde(default = "default_stats_ttl_secs")]
    pub stats_ttl_secs: u64,

    #[serde(default = "default_host_sample_interval_ms")]
    pub host_sample_interval_ms: u64,

    #[serde(default)]
    #[validate(nested)]
    pub admission: AdmissionThresholds,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_queries: default_max_concurrent_queries(),
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
            dispatch_pull_limit: default_dispatch_pull_limit(),
            batching_efficiency: default_batching_efficiency(),
            stats_capacity: default_stats_capacity(),
            stats_ttl_secs: default_stats_ttl_secs(),
            host_sample_interval_ms: default_host_sample_interval_ms(),
            admission: AdmissionThresholds::default(),
        }
    }
}

fn default_max_concurrent_queries() -> usize {
    DEFAULT_MAX_CONCURRENT_QUERIES
}
fn default_batch_window_ms() -> u64 {
    DEFAULT_BATCH_WINDOW_MS
}
fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}
fn default_dispatch_pull_limit() -> usize {
    DEFAULT_DISPATCH_PULL_LIMIT
}
fn default_batching_efficiency() -> f64 {
    DEFAULT_BATCHING_EFFICIENCY
}
fn default_stats_capacity() -> usize {
    DEFAULT_STATS_CAPACITY
}
fn default_stats_ttl_secs() -> u64 {
    DEFAULT_STATS_TTL_SECS
}
fn default_host_sample_interval_ms() -> u64 {
    DEFAULT_HOST_SAMPLE_INTERVAL_MS
}

#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct MonitorSettings {
    /// Number of latency samples kept in the rolling window.
    #[serde(default = "default_monitor_window")]
    #[validate(range(min = 1, max = 100))]
    pub window_size: usize,
    #[serde(default = "default_error_window_secs")]
    #[validate(range(min = 1))]
    pub error_window_secs: u64,
    /// More errors than this inside the error window means Critical.
    #[serde(default = "default_critical_error_count")]
    pub critical_error_count: usize,
    #[serde(default = "default_high_latency_secs")]
    pub high_latency_secs: f64,
    #[serde(default = "default_medium_latency_secs")]
    pub medium_latency_secs: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            window_size: default_monitor_window(),
            error_window_secs: default_error_window_secs(),
            critical_error_count: default_critical_error_count(),
            high_latency_secs: default_high_latency_secs(),
            medium_latency_secs: default_medium_latency_secs(),
        }
    }
}

fn default_monitor_window() -> usize {
    DEFAULT_MONITOR_WINDOW
}
fn default_error_window_secs() -> u64 {
    DEFAULT_ERROR_WINDOW_SECS
}
fn default_critical_error_count() -> usize {
    DEFAULT_CRITICAL_ERROR_COUNT
}
fn default_high_latency_secs() -> f64 {
    DEFAULT_HIGH_LATENCY_SECS
}
fn default_medium_latency_secs() -> f64 {
    DEFAULT_MEDIUM_LATENCY_SECS
}

#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct CacheSettings {
    #[serde(default = "default_cache_capacity")]
    #[validate(range(min = 1))]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}
fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

/// Connection pool, batching and retry parameters of one discovery strategy.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Validate)]
pub struct StrategySettings {
    #[validate(range(min = 1, max = 2))]
    pub pool_size: usize,
    pub max_overflow: usize,
    /// Tables introspected per pair of metadata round-trips.
    #[validate(range(min = 1, max = 5))]
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}

impl StrategySettings {
    pub fn conservative() -> Self {
        Self {
            pool_size: 1,
            max_overflow: 0,
            batch_size: 1,
            batch_delay_ms: 500,
            max_retries: 5,
            base_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            idle_timeout_secs: 15,
            connect_timeout_secs: 10,
        }
    }

    pub fn balanced() -> Self {
        Self {
            pool_size: 2,
            max_overflow: 1,
            batch_size: 2,
            batch_delay_ms: 200,
            max_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 15_000,
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }

    pub fn aggressive() -> Self {
        Self {
            pool_size: 2,
            max_overflow: 2,
            batch_size: 3,
            batch_delay_ms: 50,
            max_retries: 2,
            base_backoff_ms: 250,
            max_backoff_ms: 5_000,
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct DiscoverySettings {
    #[serde(default = "StrategySettings::conservative")]
    #[validate(nested)]
    pub conservative: StrategySettings,
    #[serde(default = "StrategySettings::balanced")]
    #[validate(nested)]
    pub balanced: StrategySettings,
    #[serde(default = "StrategySettings::aggressive")]
    #[validate(nested)]
    pub aggressive: StrategySettings,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            conservative: StrategySettings::conservative(),
            balanced: StrategySettings::balanced(),
            aggressive: StrategySettings::aggressive(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_otlp_endpoint")]
    #[validate(url)]
    pub endpoint: String,

    #[serde(default = "default_service_name_config")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            endpoint: default_otlp_endpoint(),
            service_name: default_service_name_config(),
        }
    }
}

fn default_telemetry_enabled() -> bool {
    DEFAULT_TELEMETRY_ENABLED
}

fn default_otlp_endpoint() -> String {
    DEFAULT_OTLP_ENDPOINT.to_string()
}

fn default_service_name_config() -> String {
    DEFAULT_SERVER_NAME.to_string()
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        // SLUICE_SCHEDULER__MAX_CONCURRENT_QUERIES maps to scheduler.max_concurrent_queries, etc.
        let builder = builder.add_source(
            config::Environment::with_prefix("SLUICE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {:?}", e))?;

        Ok(app_config)
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_app_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_telemetry_config_validation() {
        let config = TelemetryConfig {
            endpoint: "not_a_url".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_size_above_two_is_rejected() {
        let mut config = AppConfig::default();
        config.discovery.aggressive.pool_size = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_admission_threshold_must_be_fraction() {
        let mut config = AppConfig::default();
        config.scheduler.admission.cpu = 80.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_match_profiles() {
        let discovery = DiscoverySettings::default();
        assert_eq!(discovery.conservative.batch_size, 1);
        assert!(discovery.conservative.batch_delay_ms > discovery.balanced.batch_delay_ms);
        assert!(discovery.balanced.batch_delay_ms > discovery.aggressive.batch_delay_ms);
    }

    #[test]
    fn test_from_file_reads_yaml() -> anyhow::Result<()> {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
        writeln!(
            file,
            "scheduler:\n  max_concurrent_queries: 4\n  batch_window_ms: 25\nsources:\n  - id: local\n    dialect: sqlite\n    connection: /tmp/local.db\n"
        )?;

        let config = AppConfig::from_file(file.path().to_str().unwrap())?;
        assert_eq!(config.scheduler.max_concurrent_queries, 4);
        assert_eq!(config.scheduler.batch_window_ms, 25);
        assert_eq!(config.scheduler.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert!(config.source("local").is_some());
        assert!(config.source("missing").is_none());
        Ok(())
    }
}
