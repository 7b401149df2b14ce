//! Application configuration loaded from environment variables.

use std::str::FromStr;

use checkout::{ManagerConfig, SweeperConfig};
use common::{ItemId, Money};
use payment::GatewayConfig;
use thiserror::Error;

const DEV_CALLBACK_SECRET: &str = "dev_callback_secret";
const DEV_WEBHOOK_SECRET: &str = "dev_webhook_secret";
const MAX_SWEEP_INTERVAL_SECS: u64 = 60;
const MAX_RESERVATION_TTL_SECS: u64 = 86_400;

/// Configuration errors. Raised at startup only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidVar { var: &'static str, value: String },

    #[error("invalid SEED_CATALOG entry {entry:?}: expected SKU:stock:price_cents")]
    InvalidSeedEntry { entry: String },
}

/// An item listed in the ledger and priced in the catalog at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedItem {
    pub item_id: ItemId,
    pub stock: u32,
    pub price: Money,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` — bind address (default: `"0.0.0.0"`)
/// - `PORT` — listen port (default: `3000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `DATABASE_URL` — PostgreSQL ledger; in-memory when unset
/// - `CALLBACK_SECRET`, `WEBHOOK_SECRET` — HMAC keys for payment callbacks
/// - `RESERVATION_TTL_SECS` (600), `SWEEP_INTERVAL_SECS` (30, at most 60)
/// - `MAX_CART_LINES` (50), `WEBHOOK_TIMEOUT_MS` (10000)
/// - `IDEMPOTENCY_RETENTION_HOURS` (72)
/// - `PAYMENT_SUCCESS_REDIRECT` (`"/orders"`)
/// - `SEED_CATALOG` — `SKU:stock:price_cents` entries separated by `;`
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub callback_secret: String,
    pub webhook_secret: String,
    pub reservation_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_cart_lines: usize,
    pub webhook_timeout_ms: u64,
    pub idempotency_retention_hours: u64,
    pub success_redirect: String,
    pub seed_catalog: Vec<SeedItem>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// defaults for unset ones. Set but unparsable values are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let reservation_ttl_secs = parse_var("RESERVATION_TTL_SECS", defaults.reservation_ttl_secs)?;
        if !(1..=MAX_RESERVATION_TTL_SECS).contains(&reservation_ttl_secs) {
            return Err(ConfigError::InvalidVar {
                var: "RESERVATION_TTL_SECS",
                value: reservation_ttl_secs.to_string(),
            });
        }
        Ok(Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: parse_var("PORT", defaults.port)?,
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            callback_secret: std::env::var("CALLBACK_SECRET").unwrap_or(defaults.callback_secret),
            webhook_secret: std::env::var("WEBHOOK_SECRET").unwrap_or(defaults.webhook_secret),
            reservation_ttl_secs,
            sweep_interval_secs: parse_var("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?
                .clamp(1, MAX_SWEEP_INTERVAL_SECS),
            max_cart_lines: parse_var("MAX_CART_LINES", defaults.max_cart_lines)?,
            webhook_timeout_ms: parse_var("WEBHOOK_TIMEOUT_MS", defaults.webhook_timeout_ms)?,
            idempotency_retention_hours: parse_var(
                "IDEMPOTENCY_RETENTION_HOURS",
                defaults.idempotency_retention_hours,
            )?,
            success_redirect: std::env::var("PAYMENT_SUCCESS_REDIRECT")
                .unwrap_or(defaults.success_redirect),
            seed_catalog: match std::env::var("SEED_CATALOG") {
                Ok(raw) => parse_seed_catalog(&raw)?,
                Err(_) => defaults.seed_catalog,
            },
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when either HMAC secret is still the built-in development key.
    pub fn using_dev_secrets(&self) -> bool {
        self.callback_secret == DEV_CALLBACK_SECRET || self.webhook_secret == DEV_WEBHOOK_SECRET
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            reservation_ttl: chrono::Duration::seconds(
                self.reservation_ttl_secs.min(MAX_RESERVATION_TTL_SECS) as i64,
            ),
            max_cart_lines: self.max_cart_lines,
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: std::time::Duration::from_secs(self.sweep_interval_secs),
            ..SweeperConfig::default()
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::new(self.callback_secret.clone(), self.webhook_secret.clone())
    }

    pub fn webhook_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.webhook_timeout_ms)
    }

    pub fn idempotency_retention(&self) -> chrono::Duration {
        i64::try_from(self.idempotency_retention_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or_else(|| chrono::Duration::hours(72))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            callback_secret: DEV_CALLBACK_SECRET.to_string(),
            webhook_secret: DEV_WEBHOOK_SECRET.to_string(),
            reservation_ttl_secs: 600,
            sweep_interval_secs: 30,
            max_cart_lines: 50,
            webhook_timeout_ms: 10_000,
            idempotency_retention_hours: 72,
            success_redirect: "/orders".to_string(),
            seed_catalog: Vec::new(),
        }
    }
}

fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { var, value }),
        Err(_) => Ok(default),
    }
}

/// Parses `SKU:stock:price_cents;SKU:stock:price_cents`.
pub fn parse_seed_catalog(raw: &str) -> Result<Vec<SeedItem>, ConfigError> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = || ConfigError::InvalidSeedEntry {
                entry: entry.to_string(),
            };
            let mut parts = entry.split(':');
            let (Some(sku), Some(stock), Some(price), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return Err(invalid());
            };
            if sku.trim().is_empty() {
                return Err(invalid());
            }
            let stock: u32 = stock.trim().parse().map_err(|_| invalid())?;
            let cents: i64 = price.trim().parse().map_err(|_| invalid())?;
            if cents < 0 {
                return Err(invalid());
            }
            Ok(SeedItem {
                item_id: ItemId::new(sku.trim()),
                stock,
                price: Money::from_cents(cents),
            })
        })
        .collect()
}
