//! Application configuration.
//!
//! Layers a `config.yaml` file over environment variables using the
//! `config` crate. The environment variable names below are the
//! documented external contract and are unprefixed, since they're part of
//! this system's own interface rather than a shared umbrella namespace.

use serde::Deserialize;

/// Environment variable for the configuration file path.
pub const CONFIG_ENV_VAR: &str = "SAGA_CONFIG";
/// Prefix for configuration environment variables (layered on top of the
/// literal names below, for anything not part of the documented contract).
pub const CONFIG_ENV_PREFIX: &str = "SAGA";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SAGA_LOG";

/// Primary/replica upstream configuration for the failover proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub primary_service_url: String,
    pub replica_service_url: String,
    pub health_path: String,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    pub max_consecutive_failures: u32,
    pub listen_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            primary_service_url: "http://localhost:8081".to_string(),
            replica_service_url: "http://localhost:8082".to_string(),
            health_path: "/health".to_string(),
            health_check_interval_secs: 10,
            health_check_timeout_secs: 5,
            max_consecutive_failures: 3,
            listen_port: 8080,
        }
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub broker_url: String,
    pub max_redeliver_count: u32,
    pub ack_timeout_millis: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker_url: "in-process://channel".to_string(),
            max_redeliver_count: 3,
            ack_timeout_millis: 30_000,
        }
    }
}

/// Storage configuration for the outbox, inbox, and saga log stores.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
        }
    }
}

/// Event-collector dedup/rate-limit backend selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub use_redis: bool,
    pub redis_host: String,
    pub redis_port: u16,
    pub rate_limit_window_secs: u64,
    pub listen_port: u16,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            use_redis: false,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            rate_limit_window_secs: 60,
            listen_port: 8090,
        }
    }
}

/// Saga engine tuning (outbox/sweeper cadence, participant call deadlines).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    pub participant_timeout_secs: u64,
    pub outbox_poll_interval_millis: u64,
    pub outbox_batch_size: u32,
    pub sweeper_interval_secs: u64,
    pub control_surface_port: u16,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            participant_timeout_secs: 30,
            outbox_poll_interval_millis: 500,
            outbox_batch_size: 100,
            sweeper_interval_secs: 60,
            control_surface_port: 8000,
        }
    }
}

/// Participant service base URLs, fronted by the failover proxy for
/// the campaign service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParticipantsConfig {
    pub campaign_service_url: String,
    pub payment_service_url: String,
    pub report_service_url: String,
}

impl Default for ParticipantsConfig {
    fn default() -> Self {
        Self {
            campaign_service_url: "http://localhost:8080".to_string(),
            payment_service_url: "http://localhost:8083".to_string(),
            report_service_url: "http://localhost:8084".to_string(),
        }
    }
}

/// Aggregate application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub bus: BusConfig,
    pub proxy: ProxyConfig,
    pub collector: CollectorConfig,
    pub saga: SagaConfig,
    pub participants: ParticipantsConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, lowest to highest priority:
    /// 1. `config.yaml` in the current directory (if present)
    /// 2. the file named by [`CONFIG_ENV_VAR`] (if set)
    /// 3. the documented flat, unprefixed environment variables below
    /// 4. environment variables with the `SAGA__<section>__<field>` prefix
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false));

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&path, FileFormat::Yaml).required(true));
        }

        let builder = builder
            .set_override_option("storage.database_url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("bus.broker_url", std::env::var("BROKER_URL").ok())?
            .set_override_option(
                "bus.max_redeliver_count",
                std::env::var("MAX_REDELIVER_COUNT").ok(),
            )?
            .set_override_option(
                "bus.ack_timeout_millis",
                std::env::var("ACK_TIMEOUT_MILLIS").ok(),
            )?
            .set_override_option(
                "proxy.primary_service_url",
                std::env::var("PRIMARY_SERVICE_URL").ok(),
            )?
            .set_override_option(
                "proxy.replica_service_url",
                std::env::var("REPLICA_SERVICE_URL").ok(),
            )?
            .set_override_option("proxy.health_path", std::env::var("HEALTH_PATH").ok())?
            .set_override_option(
                "proxy.health_check_interval_secs",
                std::env::var("HEALTH_CHECK_INTERVAL").ok(),
            )?
            .set_override_option(
                "proxy.health_check_timeout_secs",
                std::env::var("HEALTH_CHECK_TIMEOUT").ok(),
            )?
            .set_override_option(
                "proxy.max_consecutive_failures",
                std::env::var("MAX_CONSECUTIVE_FAILURES").ok(),
            )?
            .set_override_option("collector.use_redis", std::env::var("USE_REDIS").ok())?
            .set_override_option("collector.redis_host", std::env::var("REDIS_HOST").ok())?
            .set_override_option("collector.redis_port", std::env::var("REDIS_PORT").ok())?;

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Configuration suitable for unit/integration tests: in-memory SQLite,
    /// in-process bus, tight probe/poll intervals.
    pub fn for_test() -> Self {
        let mut cfg = Self::default();
        cfg.saga.outbox_poll_interval_millis = 20;
        cfg.saga.sweeper_interval_secs = 1;
        cfg.proxy.health_check_interval_secs = 1;
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_standalone_friendly() {
        let config = Config::default();
        assert_eq!(config.storage.database_url, "sqlite::memory:");
        assert_eq!(config.bus.max_redeliver_count, 3);
        assert_eq!(config.proxy.max_consecutive_failures, 3);
    }

    #[test]
    fn for_test_tightens_timings() {
        let config = Config::for_test();
        assert_eq!(config.saga.outbox_poll_interval_millis, 20);
    }
}
