// Configuration management with layered configuration (file, env)

use crate::models::Tenant;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub redis: RedisConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub webhooks: WebhookConfig,
    pub subscriptions: SubscriptionConfig,
    pub scheduler: SchedulerConfig,
    pub tenancy: TenancyConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

/// Where webhook, subscription and schedule definitions live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

/// Queue defaults applied by `register_queue` when a definition omits them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub default_attempts: u32,
    pub backoff_delay_ms: u64,
    pub completed_retention_seconds: u64,
    pub completed_retention_count: usize,
    pub failed_retention_seconds: u64,
    pub failed_retention_count: usize,
    /// Active jobs silent for this long are stalled; 0 disables the sweep
    pub stall_timeout_seconds: u64,
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub timeout_seconds: u64,
    pub user_agent: String,
    /// Signs per-job webhooks, which carry no secret of their own
    pub job_signing_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub queue_name: String,
    pub default_timezone: String,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenancyConfig {
    /// Tenant that sees every tenant's jobs
    pub master_tenant_id: Option<String>,
    #[serde(default)]
    pub tenants: Vec<Tenant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Not committed to git
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.storage.backend == StorageBackend::Redis && self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty when storage backend is 'redis'".to_string());
        }

        if self.queue.default_attempts == 0 {
            return Err("Queue default_attempts must be greater than 0".to_string());
        }
        if self.queue.event_buffer == 0 {
            return Err("Queue event_buffer must be greater than 0".to_string());
        }

        if self.webhooks.timeout_seconds == 0 {
            return Err("Webhook timeout_seconds must be greater than 0".to_string());
        }
        if self.webhooks.job_signing_secret.is_empty() {
            return Err("Webhook job_signing_secret cannot be empty".to_string());
        }

        if self.subscriptions.timeout_seconds == 0 {
            return Err("Subscription timeout_seconds must be greater than 0".to_string());
        }

        if self.scheduler.queue_name.is_empty() {
            return Err("Scheduler queue_name cannot be empty".to_string());
        }
        if self
            .scheduler
            .default_timezone
            .parse::<chrono_tz::Tz>()
            .is_err()
        {
            return Err(format!(
                "Scheduler default_timezone '{}' is not a valid IANA timezone",
                self.scheduler.default_timezone
            ));
        }
        if self.scheduler.concurrency == 0 {
            return Err("Scheduler concurrency must be greater than 0".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for tenant in &self.tenancy.tenants {
            if tenant.id.is_empty() {
                return Err("Tenant id cannot be empty".to_string());
            }
            if !seen.insert(tenant.id.as_str()) {
                return Err(format!("Duplicate tenant id '{}'", tenant.id));
            }
        }

        Ok(())
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "coordinator".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_attempts: 3,
            backoff_delay_ms: 1_000,
            completed_retention_seconds: 3_600,
            completed_retention_count: 100,
            failed_retention_seconds: 86_400,
            failed_retention_count: 500,
            stall_timeout_seconds: 300,
            event_buffer: 1_024,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            user_agent: concat!("job-coordinator/", env!("CARGO_PKG_VERSION")).to_string(),
            job_signing_secret: "change-me-in-production".to_string(),
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self { timeout_seconds: 30 }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_name: "scheduled-jobs".to_string(),
            default_timezone: "UTC".to_string(),
            concurrency: 4,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: 9090,
            tracing_endpoint: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            webhooks: WebhookConfig::default(),
            subscriptions: SubscriptionConfig::default(),
            scheduler: SchedulerConfig::default(),
            tenancy: TenancyConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
