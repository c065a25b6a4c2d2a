//! Outbound provider seams
//!
//! The dunning engine and webhook handler never talk to a payment processor
//! or messaging vendor directly. They go through [`PaymentGateway`] and
//! [`Notifier`], which ship in two flavours: a logging dry run used when no
//! relay is configured, and a JSON relay client that forwards each request to
//! an HTTP endpoint.

mod logging;
pub mod messages;
#[cfg(test)]
pub(crate) mod recording;
mod relay;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BillingConfig;
use crate::dunning::RetryStrategy;
use crate::error::BillingResult;

pub use logging::{LoggingGateway, LoggingNotifier};
pub use messages::{format_amount, render, MessageContext, RenderedMessage};
pub use relay::{RelayClient, RelayGateway, RelayNotifier};

/// Acknowledgement from a messaging provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub delivered: bool,
    pub reference: Option<String>,
}

impl DeliveryReceipt {
    pub fn dry_run() -> Self {
        Self {
            delivered: false,
            reference: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRetryRequest {
    /// Stable across retries of the same dunning step, so the processor
    /// charges at most once for it
    #[serde(skip)]
    pub idempotency_key: String,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub invoice_ref: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub strategy: RetryStrategy,
}

/// Outcome of asking the processor to collect again
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentAttempt {
    /// Nothing was charged, e.g. dry-run mode
    NotAttempted,
    Succeeded {
        amount_cents: i64,
        reference: Option<String>,
    },
    Declined {
        decline_code: Option<String>,
    },
}

impl PaymentAttempt {
    pub fn recovered_cents(&self) -> Option<i64> {
        match self {
            PaymentAttempt::Succeeded { amount_cents, .. } => Some(*amount_cents),
            _ => None,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn retry_payment(&self, request: &PaymentRetryRequest) -> BillingResult<PaymentAttempt>;

    async fn apply_discount(
        &self,
        subscription_ref: &str,
        percent: u8,
        months: u8,
    ) -> BillingResult<()>;

    async fn cancel_subscription(&self, subscription_ref: &str) -> BillingResult<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_email(&self, to: &str, message: &RenderedMessage)
        -> BillingResult<DeliveryReceipt>;

    async fn send_sms(&self, to: &str, body: &str) -> BillingResult<DeliveryReceipt>;

    async fn request_call(
        &self,
        phone: &str,
        customer_name: &str,
        purpose: &str,
    ) -> BillingResult<DeliveryReceipt>;
}

/// Build the configured providers, falling back to the logging dry run
pub fn from_config(config: &BillingConfig) -> (Arc<dyn PaymentGateway>, Arc<dyn Notifier>) {
    let gateway: Arc<dyn PaymentGateway> = match &config.payments_relay_url {
        Some(url) => {
            tracing::info!(relay = %url, "Payment relay enabled");
            Arc::new(RelayGateway::new(RelayClient::new(
                url.clone(),
                config.relay_api_key.clone(),
            )))
        }
        None => {
            tracing::warn!("PAYMENTS_RELAY_URL not set, payment operations run as dry run");
            Arc::new(LoggingGateway)
        }
    };

    let notifier: Arc<dyn Notifier> = match &config.notify_relay_url {
        Some(url) => {
            tracing::info!(relay = %url, "Notification relay enabled");
            Arc::new(RelayNotifier::new(RelayClient::new(
                url.clone(),
                config.relay_api_key.clone(),
            )))
        }
        None => {
            tracing::warn!("NOTIFY_RELAY_URL not set, notifications are only logged");
            Arc::new(LoggingNotifier)
        }
    };

    (gateway, notifier)
}
