//! Configuration for invoice-payment-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub initiation: InitiationConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

/// Which Daraja deployment outbound calls are sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEnvironment {
    Sandbox,
    Production,
}

impl GatewayEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            GatewayEnvironment::Sandbox => "https://sandbox.safaricom.co.ke",
            GatewayEnvironment::Production => "https://api.safaricom.co.ke",
        }
    }
}

impl FromStr for GatewayEnvironment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(GatewayEnvironment::Sandbox),
            "production" => Ok(GatewayEnvironment::Production),
            other => Err(anyhow::anyhow!(
                "unknown gateway environment '{}', expected 'sandbox' or 'production'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub environment: GatewayEnvironment,
    /// Overrides the environment's base URL (mock gateways in tests).
    pub api_base_url: Option<String>,
    /// Public URL of this service's STK callback route.
    pub callback_url: String,
    pub timeout: Duration,
    /// Offset of the clock used for the request `Timestamp` and `Password`.
    pub utc_offset_minutes: i32,
}

impl GatewayConfig {
    pub fn base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .unwrap_or_else(|| self.environment.base_url())
    }
}

#[derive(Debug, Clone)]
pub struct InitiationConfig {
    /// Calling code that replaces a leading trunk `0` on phone numbers.
    pub country_code: String,
    /// How long a claimed initiation attempt blocks a concurrent one.
    pub attempt_lease: Duration,
}

impl PaymentConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let environment = env::var("DARAJA_ENVIRONMENT")
            .unwrap_or_else(|_| "sandbox".to_string())
            .parse::<GatewayEnvironment>()
            .map_err(AppError::ConfigError)?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "invoice-payment-service".to_string()),
            log_level: env::var("LOG_LEVEL")
                .unwrap_or_else(|_| "info,invoice_payment_service=debug".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: Secret::new(env::var("PAYMENT_DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("PAYMENT_DATABASE_URL is required"))
                })?),
                db_name: env::var("PAYMENT_DATABASE_NAME")
                    .unwrap_or_else(|_| "property_db".to_string()),
            },
            gateway: GatewayConfig {
                environment,
                api_base_url: env::var("DARAJA_API_URL").ok().filter(|s| !s.is_empty()),
                callback_url: env::var("DARAJA_CALLBACK_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DARAJA_CALLBACK_URL is required"))
                })?,
                timeout: Duration::from_secs(parse_or("DARAJA_TIMEOUT_SECS", 30)),
                utc_offset_minutes: parse_or("DARAJA_UTC_OFFSET_MINUTES", 180),
            },
            initiation: InitiationConfig {
                country_code: env::var("PHONE_COUNTRY_CODE")
                    .unwrap_or_else(|_| "254".to_string()),
                attempt_lease: Duration::from_secs(parse_or("PAYMENT_ATTEMPT_LEASE_SECS", 90)),
            },
        })
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
