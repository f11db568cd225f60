use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub auth: AuthConfig,
    pub locks: LockConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    pub checkout: CheckoutConfig,
    pub gateway: GatewayConfig,
    pub documents: DocumentsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
}

fn default_group_id() -> String {
    "weave-invoice-worker".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiration_seconds: u64,
}

/// How long a caller waits for a busy advisory lock.
#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    pub wait_ms: u64,
    pub retry_interval_ms: u64,
}

impl LockConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CardFeeConfig {
    pub rate: Decimal,
    pub fixed: Decimal,
}

/// Card fees keyed by ISO currency code.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PricingConfig {
    #[serde(default)]
    pub card_fees: HashMap<String, CardFeeConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckoutConfig {
    pub callback_base_url: String,
    pub invoice_print_base_url: String,
    pub invoice_bucket: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub api_base_url: String,
    /// Unset in local development; the API then runs against the mock gateway.
    pub secret_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    pub renderer_url: String,
    pub storage_url: String,
    pub storage_token: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `WEAVE__DATABASE__URL=postgres://...`
            .add_source(config::Environment::with_prefix("WEAVE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
