use async_trait::async_trait;

use super::{
    DeliveryReceipt, Notifier, PaymentAttempt, PaymentGateway, PaymentRetryRequest,
    RenderedMessage,
};
use crate::error::BillingResult;

/// Dry-run gateway: logs the request, never charges
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingGateway;

#[async_trait]
impl PaymentGateway for LoggingGateway {
    async fn retry_payment(&self, request: &PaymentRetryRequest) -> BillingResult<PaymentAttempt> {
        tracing::info!(
            subscription = ?request.subscription_ref,
            amount_cents = request.amount_cents,
            strategy = %request.strategy,
            "[dry run] payment retry"
        );
        Ok(PaymentAttempt::NotAttempted)
    }

    async fn apply_discount(
        &self,
        subscription_ref: &str,
        percent: u8,
        months: u8,
    ) -> BillingResult<()> {
        tracing::info!(
            subscription = %subscription_ref,
            percent,
            months,
            "[dry run] apply discount"
        );
        Ok(())
    }

    async fn cancel_subscription(&self, subscription_ref: &str) -> BillingResult<()> {
        tracing::info!(subscription = %subscription_ref, "[dry run] cancel subscription");
        Ok(())
    }
}

/// Dry-run notifier: logs the message instead of sending it
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send_email(
        &self,
        to: &str,
        message: &RenderedMessage,
    ) -> BillingResult<DeliveryReceipt> {
        tracing::info!(
            to = %to,
            template = %message.template,
            subject = %message.subject,
            "[dry run] email"
        );
        Ok(DeliveryReceipt::dry_run())
    }

    async fn send_sms(&self, to: &str, body: &str) -> BillingResult<DeliveryReceipt> {
        tracing::info!(to = %to, chars = body.len(), "[dry run] sms");
        Ok(DeliveryReceipt::dry_run())
    }

    async fn request_call(
        &self,
        phone: &str,
        customer_name: &str,
        purpose: &str,
    ) -> BillingResult<DeliveryReceipt> {
        tracing::info!(
            phone = %phone,
            customer = %customer_name,
            purpose = %purpose,
            "[dry run] call request"
        );
        Ok(DeliveryReceipt::dry_run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dunning::RetryStrategy;

    #[tokio::test]
    async fn dry_run_never_recovers() {
        let attempt = LoggingGateway
            .retry_payment(&PaymentRetryRequest {
                idempotency_key: "campaign:1".into(),
                customer_ref: None,
                subscription_ref: Some("sub_1".into()),
                invoice_ref: None,
                amount_cents: 9_700,
                currency: "USD".into(),
                strategy: RetryStrategy::SmartRouting,
            })
            .await
            .unwrap();
        assert_eq!(attempt, PaymentAttempt::NotAttempted);
    }

    #[tokio::test]
    async fn dry_run_notifier_is_not_delivered() {
        let receipt = LoggingNotifier.send_sms("+15550100", "hello").await.unwrap();
        assert!(!receipt.delivered);
    }
}
