//! Billing configuration loaded from the environment

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Default webhook timestamp tolerance (5 minutes)
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Shared secret used to sign webhook payloads
    pub webhook_secret: String,
    /// Maximum clock skew accepted on a webhook signature timestamp
    pub webhook_tolerance: Duration,
    /// Campaigns claimed per sweep
    pub dunning_batch_size: i64,
    /// How long a sweep owns a claimed campaign before another worker may take it
    pub dunning_lease: Duration,
    /// Link included in customer-facing messages
    pub billing_portal_url: String,
    /// Optional JSON relay for email/SMS/call requests
    pub notify_relay_url: Option<String>,
    /// Optional JSON relay for payment operations
    pub payments_relay_url: Option<String>,
    /// Bearer token sent to both relays
    pub relay_api_key: Option<String>,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("WEBHOOK_SECRET must be set".to_string()))?;
        if webhook_secret.is_empty() {
            return Err(BillingError::Config(
                "WEBHOOK_SECRET must not be empty".to_string(),
            ));
        }

        Ok(Self {
            webhook_secret,
            webhook_tolerance: Duration::from_secs(parse_env(
                "WEBHOOK_TOLERANCE_SECS",
                DEFAULT_WEBHOOK_TOLERANCE_SECS,
            )?),
            dunning_batch_size: parse_env("DUNNING_BATCH_SIZE", 100)?,
            dunning_lease: Duration::from_secs(parse_env("DUNNING_LEASE_SECS", 300)?),
            billing_portal_url: std::env::var("BILLING_PORTAL_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing".to_string()),
            notify_relay_url: non_empty_env("NOTIFY_RELAY_URL"),
            payments_relay_url: non_empty_env("PAYMENTS_RELAY_URL"),
            relay_api_key: non_empty_env("RELAY_API_KEY"),
        })
    }

    /// Config for tests and local tooling
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: secret.into(),
            webhook_tolerance: Duration::from_secs(DEFAULT_WEBHOOK_TOLERANCE_SECS),
            dunning_batch_size: 100,
            dunning_lease: Duration::from_secs(300),
            billing_portal_url: "http://localhost:3000/billing".to_string(),
            notify_relay_url: None,
            payments_relay_url: None,
            relay_api_key: None,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: [&str; 5] = [
        "WEBHOOK_SECRET",
        "WEBHOOK_TOLERANCE_SECS",
        "DUNNING_BATCH_SIZE",
        "NOTIFY_RELAY_URL",
        "PAYMENTS_RELAY_URL",
    ];

    fn clear() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn secret_is_required() {
        clear();
        assert!(matches!(BillingConfig::from_env(), Err(BillingError::Config(_))));

        std::env::set_var("WEBHOOK_SECRET", "");
        assert!(matches!(BillingConfig::from_env(), Err(BillingError::Config(_))));
        clear();
    }

    #[test]
    #[serial]
    fn blank_relay_urls_select_dry_run() {
        clear();
        std::env::set_var("WEBHOOK_SECRET", "whsec_test");
        std::env::set_var("NOTIFY_RELAY_URL", "  ");
        let config = BillingConfig::from_env().unwrap();
        assert!(config.notify_relay_url.is_none());
        assert!(config.payments_relay_url.is_none());
        assert_eq!(config.webhook_tolerance, Duration::from_secs(300));
        clear();
    }

    #[test]
    #[serial]
    fn malformed_numbers_are_config_errors() {
        clear();
        std::env::set_var("WEBHOOK_SECRET", "whsec_test");
        std::env::set_var("DUNNING_BATCH_SIZE", "lots");
        let err = BillingConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DUNNING_BATCH_SIZE"));
        clear();
    }
}
