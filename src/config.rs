// config.rs
use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{0} is not a valid value: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
}

#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `None` runs the service on the in-memory store.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub jwt_maxage: i64,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub mpesa: MpesaConfig,
    pub paypal: PayPalConfig,
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn optional(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn init() -> Result<Config, ConfigError> {
        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());
        let jwt_secret = required("JWT_SECRET_KEY")?;
        let jwt_maxage = required("JWT_MAXAGE")?;
        let jwt_maxage = jwt_maxage
            .parse::<i64>()
            .map_err(|_| ConfigError::Invalid("JWT_MAXAGE", jwt_maxage))?;

        let port = optional("PORT", "8000");
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::Invalid("PORT", port))?;

        let allowed_origins = optional("ALLOWED_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        let mpesa = MpesaConfig {
            base_url: optional("MPESA_BASE_URL", "https://sandbox.safaricom.co.ke"),
            consumer_key: optional("MPESA_CONSUMER_KEY", ""),
            consumer_secret: optional("MPESA_CONSUMER_SECRET", ""),
            shortcode: optional("MPESA_SHORTCODE", "174379"),
            passkey: optional("MPESA_PASSKEY", ""),
            callback_url: optional("MPESA_CALLBACK_URL", "http://localhost:8000/api/mpesa/callback"),
        };

        let paypal = PayPalConfig {
            base_url: optional("PAYPAL_BASE_URL", "https://api-m.sandbox.paypal.com"),
            client_id: optional("PAYPAL_CLIENT_ID", ""),
            client_secret: optional("PAYPAL_CLIENT_SECRET", ""),
        };

        Ok(Config {
            database_url,
            jwt_secret,
            jwt_maxage,
            port,
            allowed_origins,
            mpesa,
            paypal,
        })
    }
}
