//! Layered application settings
//!
//! Sources, later ones winning:
//! 1. `config/default.toml` (optional)
//! 2. `config/{ENVIRONMENT}.toml` (optional)
//! 3. `PAYORCH__SECTION__KEY` environment variables
//! 4. `DATABASE_URL`, if set
//!
//! A gateway section that is absent disables that payment method.

use crate::logging::Environment;
use crate::payments::providers::{CardGatewayConfig, PushPaymentConfig, RedirectCaptureConfig};
use crate::payments::token_cache::DEFAULT_SAFETY_MARGIN_RATIO;
use crate::payments::types::PaymentMethod;
use crate::workers::status_reconciler::ReconcilerConfig;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, File};
use serde::Deserialize;

const ENV_PREFIX: &str = "PAYORCH";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/payorch".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenCacheConfig {
    /// Fraction of each token's lifetime that is never used
    pub safety_margin_ratio: f64,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            safety_margin_ratio: DEFAULT_SAFETY_MARGIN_RATIO,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub push_payment: Option<PushPaymentConfig>,
    pub redirect_capture: Option<RedirectCaptureConfig>,
    pub card: Option<CardGatewayConfig>,
    #[serde(default)]
    pub token_cache: TokenCacheConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let environment = Environment::from_env();
        let builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment.as_str())).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?;

        let mut settings = Self::from_builder(builder)?;
        settings.reconciler = settings.reconciler.apply_env_overrides();
        Ok(settings)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.token_cache.safety_margin_ratio) {
            return Err(ConfigError::Message(
                "token_cache.safety_margin_ratio must be in [0, 1)".to_string(),
            ));
        }
        if self.reconciler.batch_size == 0 {
            return Err(ConfigError::Message("reconciler.batch_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Methods with a configured gateway.
    pub fn enabled_methods(&self) -> Vec<PaymentMethod> {
        PaymentMethod::ALL
            .into_iter()
            .filter(|m| match m {
                PaymentMethod::PushPayment => self.push_payment.is_some(),
                PaymentMethod::RedirectCapture => self.redirect_capture.is_some(),
                PaymentMethod::Card => self.card.is_some(),
            })
            .collect()
    }
}
