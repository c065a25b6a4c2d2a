//! Providers that record every call, for tests

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    DeliveryReceipt, Notifier, PaymentAttempt, PaymentGateway, PaymentRetryRequest,
    RenderedMessage,
};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Retry { idempotency_key: String, subscription_ref: Option<String>, amount_cents: i64 },
    Discount { subscription_ref: String, percent: u8, months: u8 },
    Cancel { subscription_ref: String },
    Email { to: String, template: String },
    Sms { to: String },
    PhoneCall { to: String, purpose: String },
}

/// Gateway whose retry results are scripted up front.
///
/// When the script runs out every retry is declined.
#[derive(Default)]
pub struct RecordingGateway {
    pub calls: Mutex<Vec<Call>>,
    script: Mutex<VecDeque<BillingResult<PaymentAttempt>>>,
}

impl RecordingGateway {
    pub fn scripted(results: Vec<BillingResult<PaymentAttempt>>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(results.into()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for RecordingGateway {
    async fn retry_payment(&self, request: &PaymentRetryRequest) -> BillingResult<PaymentAttempt> {
        self.calls.lock().unwrap().push(Call::Retry {
            idempotency_key: request.idempotency_key.clone(),
            subscription_ref: request.subscription_ref.clone(),
            amount_cents: request.amount_cents,
        });
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(PaymentAttempt::Declined { decline_code: None }))
    }

    async fn apply_discount(
        &self,
        subscription_ref: &str,
        percent: u8,
        months: u8,
    ) -> BillingResult<()> {
        self.calls.lock().unwrap().push(Call::Discount {
            subscription_ref: subscription_ref.to_string(),
            percent,
            months,
        });
        Ok(())
    }

    async fn cancel_subscription(&self, subscription_ref: &str) -> BillingResult<()> {
        self.calls.lock().unwrap().push(Call::Cancel {
            subscription_ref: subscription_ref.to_string(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub calls: Mutex<Vec<Call>>,
    pub fail_emails: bool,
}

impl RecordingNotifier {
    pub fn failing_emails() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_emails: true,
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_email(
        &self,
        to: &str,
        message: &RenderedMessage,
    ) -> BillingResult<DeliveryReceipt> {
        self.calls.lock().unwrap().push(Call::Email {
            to: to.to_string(),
            template: message.template.clone(),
        });
        if self.fail_emails {
            return Err(BillingError::Provider("smtp relay down".into()));
        }
        Ok(DeliveryReceipt {
            delivered: true,
            reference: Some("msg_test".into()),
        })
    }

    async fn send_sms(&self, to: &str, _body: &str) -> BillingResult<DeliveryReceipt> {
        self.calls.lock().unwrap().push(Call::Sms { to: to.to_string() });
        Ok(DeliveryReceipt {
            delivered: true,
            reference: None,
        })
    }

    async fn request_call(
        &self,
        phone: &str,
        _customer_name: &str,
        purpose: &str,
    ) -> BillingResult<DeliveryReceipt> {
        self.calls.lock().unwrap().push(Call::PhoneCall {
            to: phone.to_string(),
            purpose: purpose.to_string(),
        });
        Ok(DeliveryReceipt {
            delivered: true,
            reference: None,
        })
    }
}
