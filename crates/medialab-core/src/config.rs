//! Application configuration
//!
//! Centralized configuration management using the `config` crate. Values are
//! layered: built-in defaults, `config/default`, `config/{RUN_MODE}`, then
//! `MEDIALAB__SECTION__KEY` environment variables.

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
}

/// Health server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600
}

/// Redis configuration (job queue and outcome channel)
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Prefix applied to every queue key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "medialab".to_string()
}

/// Billing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BillingConfig {
    /// Balance credited to a newly registered user, in minor units
    #[serde(default = "default_starting_balance")]
    pub starting_balance: i64,

    /// Age after which a `Reserved` operation is failed by the sweeper
    #[serde(default = "default_reservation_ttl")]
    pub reservation_ttl_secs: u64,

    /// How often the sweeper runs
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_starting_balance() -> i64 {
    3000 // 30.00
}

fn default_reservation_ttl() -> u64 {
    86400 // matches the queue job TTL
}

fn default_sweep_interval() -> u64 {
    600
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            starting_balance: default_starting_balance(),
            reservation_ttl_secs: default_reservation_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl BillingConfig {
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }
}

/// Price table in major currency units.
///
/// `kinds` maps an operation kind (`generate`, `face_swap`, ...) to its base
/// price. `models` overrides the base price for specific model/kind pairs.
#[derive(Debug, Deserialize, Clone)]
pub struct PricingConfig {
    #[serde(default = "default_kind_prices")]
    pub kinds: HashMap<String, Decimal>,

    #[serde(default = "default_model_prices")]
    pub models: Vec<ModelPriceRule>,
}

/// Price override for a model on a subset of operation kinds
#[derive(Debug, Deserialize, Clone)]
pub struct ModelPriceRule {
    pub model: String,
    pub kinds: Vec<String>,
    pub price: Decimal,
}

fn default_kind_prices() -> HashMap<String, Decimal> {
    [
        ("generate", 9),
        ("edit", 9),
        ("merge", 9),
        ("retouch", 9),
        ("upscale", 9),
        ("face_swap", 4),
        ("prompt_generation", 3),
        ("add_text", 1),
    ]
    .into_iter()
    .map(|(kind, major)| (kind.to_string(), Decimal::from(major)))
    .collect()
}

fn default_model_prices() -> Vec<ModelPriceRule> {
    vec![
        ModelPriceRule {
            model: "nano-banana-pro".to_string(),
            kinds: vec!["generate".to_string(), "merge".to_string()],
            price: Decimal::from(26),
        },
        ModelPriceRule {
            model: "seedream".to_string(),
            kinds: vec![
                "generate".to_string(),
                "edit".to_string(),
                "merge".to_string(),
            ],
            price: Decimal::new(75, 1),
        },
    ]
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            kinds: default_kind_prices(),
            models: default_model_prices(),
        }
    }
}

/// Job queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Logical queue name, used in key names
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Lease granted to a consumer per delivery
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    /// Sleep between empty dequeue polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum deliveries before a retryable failure becomes terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_queue_name() -> String {
    "generation".to_string()
}

fn default_lease() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff() -> u64 {
    2000
}

fn default_max_backoff() -> u64 {
    60_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            lease_secs: default_lease(),
            poll_interval_ms: default_poll_interval(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl QueueConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Worker pool configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Number of worker tasks in this process
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Upper bound on one provider round-trip (submit, poll, download)
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Delay between provider status polls
    #[serde(default = "default_provider_poll_interval")]
    pub provider_poll_interval_ms: u64,

    /// Generation provider base URL
    #[serde(default = "default_provider_url")]
    pub provider_base_url: String,

    /// Generation provider API key
    #[serde(default)]
    pub provider_api_key: String,

    /// Directory where delivered artifacts are written
    #[serde(default = "default_media_dir")]
    pub media_dir: String,

    /// Redis channel that outcome notifications are published on
    #[serde(default = "default_outcome_channel")]
    pub outcome_channel: String,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_job_timeout() -> u64 {
    240
}

fn default_provider_poll_interval() -> u64 {
    2000
}

fn default_provider_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_media_dir() -> String {
    "media".to_string()
}

fn default_outcome_channel() -> String {
    "medialab:outcomes".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            job_timeout_secs: default_job_timeout(),
            provider_poll_interval_ms: default_provider_poll_interval(),
            provider_base_url: default_provider_url(),
            provider_api_key: String::new(),
            media_dir: default_media_dir(),
            outcome_channel: default_outcome_channel(),
        }
    }
}

impl WorkerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn provider_poll_interval(&self) -> Duration {
        Duration::from_millis(self.provider_poll_interval_ms)
    }
}

/// Statistics aggregator configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StatisticsConfig {
    #[serde(default = "default_statistics_interval")]
    pub interval_secs: u64,
}

fn default_statistics_interval() -> u64 {
    300
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_statistics_interval(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and optional config files
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("redis.key_prefix", "medialab")?
            .set_default("billing.starting_balance", 3000)?
            .set_default("billing.reservation_ttl_secs", 86400)?
            .set_default("queue.lease_secs", 300)?
            .set_default("queue.max_attempts", 3)?
            .set_default("worker.count", num_cpus::get() as i64)?
            .set_default("worker.job_timeout_secs", 240)?
            .set_default("statistics.interval_secs", 300)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("MEDIALAB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("MEDIALAB").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Get the health server bind address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
