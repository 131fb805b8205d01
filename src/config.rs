//! Per-service configuration loaded from the environment.
//!
//! Every binary calls [`load_config`] with its default port; the broker
//! and store URLs are required, everything else has defaults. Handles
//! built from this config are threaded through constructors; there are
//! no module-level globals.

use config::{Config, ConfigError, Environment};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::error;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Private store for this service.
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Shared cache/lock store.
    #[validate(length(min = 1))]
    pub redis_url: String,

    /// Broker URL backing the partitioned event log.
    #[validate(length(min = 1))]
    pub kafka_brokers: String,

    /// Broker URL backing the request/reply bus.
    #[validate(length(min = 1))]
    pub nats_url: String,

    /// Accepted for parity with the deployment manifests; trace export
    /// is wired outside the core.
    #[serde(default)]
    pub jaeger_endpoint: Option<String>,

    /// HTTP port; each binary installs its own default.
    pub port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Deadline for a fraud.check reply.
    #[serde(default = "default_fraud_timeout_secs")]
    pub fraud_timeout_secs: u64,

    /// TTL of the per-payment processing lock.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// How often the orchestrator scans for stalled authorizations.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Age at which an AUTH_PENDING row is demoted to FAILED.
    /// Defaults to twice the fraud timeout.
    #[serde(default)]
    pub stuck_threshold_secs: Option<u64>,

    /// Flat fee credited to the platform account per settled payment.
    #[serde(default = "default_platform_fee")]
    pub platform_fee: Decimal,

    /// Max payments per customer per hour before the velocity rule denies.
    #[serde(default = "default_velocity_limit")]
    pub velocity_limit: i64,

    /// Amounts above this are denied outright.
    #[serde(default = "default_amount_ceiling")]
    pub amount_ceiling: Decimal,

    /// Amounts above this are routed to manual review.
    #[serde(default = "default_review_threshold")]
    pub review_threshold: Decimal,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
}

impl AppConfig {
    pub fn fraud_timeout(&self) -> Duration {
        Duration::from_secs(self.fraud_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(
            self.stuck_threshold_secs
                .unwrap_or(self.fraud_timeout_secs * 2),
        )
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_fraud_timeout_secs() -> u64 {
    5
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_platform_fee() -> Decimal {
    Decimal::new(200, 2)
}

fn default_velocity_limit() -> i64 {
    5
}

fn default_amount_ceiling() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_review_threshold() -> Decimal {
    Decimal::new(5_000, 0)
}

fn default_db_max_connections() -> u32 {
    16
}

fn default_db_min_connections() -> u32 {
    2
}

fn default_db_connect_timeout_secs() -> u64 {
    30
}

/// Initializes tracing with the configured level as the default filter.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("payflow={level},tower_http=info");
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = fmt().with_env_filter(filter).try_init();
}

/// Loads configuration from the environment, applying the service's
/// default port.
pub fn load_config(default_port: u16) -> Result<AppConfig, AppConfigError> {
    let config = Config::builder()
        .set_default("port", i64::from(default_port))?
        .add_source(Environment::default())
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Env vars are process-global; serialize the tests that touch them.
    static ENV_GUARD: Mutex<()> = Mutex::new(());

    fn set_required_env() {
        env::set_var("DATABASE_URL", "postgres://localhost/payments");
        env::set_var("REDIS_URL", "redis://localhost:6379");
        env::set_var("KAFKA_BROKERS", "redis://localhost:6379/1");
        env::set_var("NATS_URL", "redis://localhost:6379/2");
    }

    fn clear_optional_env() {
        for key in ["PORT", "FRAUD_TIMEOUT_SECS", "PLATFORM_FEE"] {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_apply_when_env_is_minimal() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_required_env();
        clear_optional_env();

        let config = load_config(8081).unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.fraud_timeout(), Duration::from_secs(5));
        assert_eq!(config.stuck_threshold(), Duration::from_secs(10));
        assert_eq!(config.platform_fee, Decimal::new(200, 2));
        assert_eq!(config.velocity_limit, 5);
    }

    #[test]
    fn env_overrides_defaults() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_required_env();
        env::set_var("PORT", "9999");
        env::set_var("FRAUD_TIMEOUT_SECS", "2");
        env::set_var("PLATFORM_FEE", "3.50");

        let config = load_config(8081).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.fraud_timeout(), Duration::from_secs(2));
        assert_eq!(config.stuck_threshold(), Duration::from_secs(4));
        assert_eq!(config.platform_fee, Decimal::new(350, 2));

        clear_optional_env();
    }
}
