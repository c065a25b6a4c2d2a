//! JSON-over-HTTP relay providers
//!
//! Each operation is a `POST {base_url}/{path}` with a JSON body and an
//! optional bearer token. Transport errors and 5xx responses are retried with
//! exponential backoff; 4xx responses fail immediately. Payment retries carry
//! an `Idempotency-Key` header so a retried POST never charges twice.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::{
    DeliveryReceipt, Notifier, PaymentAttempt, PaymentGateway, PaymentRetryRequest,
    RenderedMessage,
};
use crate::error::{BillingError, BillingResult};

const DEFAULT_RETRIES: usize = 3;
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum RelayFailure {
    Transport(reqwest::Error),
    Server(StatusCode, String),
    Rejected(StatusCode, String),
    Decode(String),
}

impl RelayFailure {
    fn is_retryable(&self) -> bool {
        matches!(self, RelayFailure::Transport(_) | RelayFailure::Server(..))
    }
}

impl From<RelayFailure> for BillingError {
    fn from(failure: RelayFailure) -> Self {
        match failure {
            RelayFailure::Transport(e) => BillingError::Provider(format!("relay unreachable: {e}")),
            RelayFailure::Server(status, body) => {
                BillingError::Provider(format!("relay returned {status}: {body}"))
            }
            RelayFailure::Rejected(status, body) => {
                BillingError::InvalidInput(format!("relay rejected request ({status}): {body}"))
            }
            RelayFailure::Decode(msg) => {
                BillingError::Provider(format!("relay response unreadable: {msg}"))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: usize,
    base_delay_ms: u64,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            max_retries: DEFAULT_RETRIES,
            base_delay_ms: 50,
        }
    }

    /// Override retry count and initial backoff
    pub fn with_retries(mut self, max_retries: usize, base_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.base_delay_ms = base_delay_ms.max(1);
        self
    }

    pub async fn post<B, R>(&self, path: &str, body: &B) -> BillingResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.post_with_key(path, body, None).await
    }

    /// Same as `post`, sending `idempotency_key` on every attempt
    pub async fn post_with_key<B, R>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> BillingResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.base_delay_ms)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.max_retries);

        let result = RetryIf::start(
            strategy,
            || self.send_once::<B, R>(&url, body, idempotency_key),
            |failure: &RelayFailure| {
                let retry = failure.is_retryable();
                if retry {
                    tracing::warn!(url = %url, error = ?failure, "Relay call failed, retrying");
                }
                retry
            },
        )
        .await;

        result.map_err(|failure| {
            tracing::error!(url = %url, error = ?failure, "Relay call failed");
            BillingError::from(failure)
        })
    }

    async fn send_once<B, R>(
        &self,
        url: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<R, RelayFailure>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut request = self.http.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_HEADER, key);
        }

        let response = request.send().await.map_err(RelayFailure::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(RelayFailure::Transport)?;

        if status.is_server_error() {
            return Err(RelayFailure::Server(status, text));
        }
        if !status.is_success() {
            return Err(RelayFailure::Rejected(status, text));
        }

        let raw = if text.trim().is_empty() { "{}" } else { text.as_str() };
        serde_json::from_str(raw).map_err(|e| RelayFailure::Decode(e.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RelayAck {
    #[serde(default)]
    id: Option<String>,
}

impl From<RelayAck> for DeliveryReceipt {
    fn from(ack: RelayAck) -> Self {
        DeliveryReceipt {
            delivered: true,
            reference: ack.id,
        }
    }
}

/// Payment operations forwarded to a relay
#[derive(Debug, Clone)]
pub struct RelayGateway {
    client: RelayClient,
}

impl RelayGateway {
    pub fn new(client: RelayClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PaymentGateway for RelayGateway {
    async fn retry_payment(&self, request: &PaymentRetryRequest) -> BillingResult<PaymentAttempt> {
        self.client
            .post_with_key("payments/retry", request, Some(request.idempotency_key.as_str()))
            .await
    }

    async fn apply_discount(
        &self,
        subscription_ref: &str,
        percent: u8,
        months: u8,
    ) -> BillingResult<()> {
        let body = json!({
            "subscription": subscription_ref,
            "percent_off": percent,
            "duration_months": months,
        });
        let _: RelayAck = self.client.post("subscriptions/discount", &body).await?;
        Ok(())
    }

    async fn cancel_subscription(&self, subscription_ref: &str) -> BillingResult<()> {
        let body = json!({ "subscription": subscription_ref });
        let _: RelayAck = self.client.post("subscriptions/cancel", &body).await?;
        Ok(())
    }
}

/// Email, SMS and call requests forwarded to a relay
#[derive(Debug, Clone)]
pub struct RelayNotifier {
    client: RelayClient,
}

impl RelayNotifier {
    pub fn new(client: RelayClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for RelayNotifier {
    async fn send_email(
        &self,
        to: &str,
        message: &RenderedMessage,
    ) -> BillingResult<DeliveryReceipt> {
        let body = json!({
            "to": to,
            "template": message.template,
            "subject": message.subject,
            "text": message.body,
        });
        let ack: RelayAck = self.client.post("email", &body).await?;
        Ok(ack.into())
    }

    async fn send_sms(&self, to: &str, text: &str) -> BillingResult<DeliveryReceipt> {
        let body = json!({ "to": to, "text": text });
        let ack: RelayAck = self.client.post("sms", &body).await?;
        Ok(ack.into())
    }

    async fn request_call(
        &self,
        phone: &str,
        customer_name: &str,
        purpose: &str,
    ) -> BillingResult<DeliveryReceipt> {
        let body = json!({
            "to": phone,
            "customer_name": customer_name,
            "purpose": purpose,
        });
        let ack: RelayAck = self.client.post("calls", &body).await?;
        Ok(ack.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dunning::RetryStrategy;
    use mockito::Matcher;

    fn retry_request() -> PaymentRetryRequest {
        PaymentRetryRequest {
            idempotency_key: "7d2c5f0e-campaign:3".into(),
            customer_ref: Some("cus_1".into()),
            subscription_ref: Some("sub_1".into()),
            invoice_ref: Some("in_1".into()),
            amount_cents: 150_000,
            currency: "USD".into(),
            strategy: RetryStrategy::PremiumRouting,
        }
    }

    #[tokio::test]
    async fn email_sends_bearer_token_and_returns_reference() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/email")
            .match_header("authorization", "Bearer relay-key")
            .match_body(Matcher::PartialJson(json!({
                "to": "ada@example.com",
                "template": "payment_failed_gentle",
            })))
            .with_status(200)
            .with_body(r#"{"id":"msg_123"}"#)
            .create_async()
            .await;

        let notifier = RelayNotifier::new(RelayClient::new(server.url(), Some("relay-key".into())));
        let message = RenderedMessage {
            template: "payment_failed_gentle".into(),
            subject: "s".into(),
            body: "b".into(),
        };
        let receipt = notifier.send_email("ada@example.com", &message).await.unwrap();

        mock.assert_async().await;
        assert!(receipt.delivered);
        assert_eq!(receipt.reference.as_deref(), Some("msg_123"));
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/payments/retry")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let gateway = RelayGateway::new(RelayClient::new(server.url(), None).with_retries(2, 1));
        let err = gateway.retry_payment(&retry_request()).await.unwrap_err();

        failing.assert_async().await;
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn retried_payment_reuses_idempotency_key() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/payments/retry")
            .match_header("idempotency-key", "7d2c5f0e-campaign:3")
            .with_status(502)
            .expect(2)
            .create_async()
            .await;

        let gateway = RelayGateway::new(RelayClient::new(server.url(), None).with_retries(1, 1));
        let err = gateway.retry_payment(&retry_request()).await.unwrap_err();

        failing.assert_async().await;
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn client_errors_fail_fast() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("POST", "/subscriptions/cancel")
            .with_status(422)
            .with_body("unknown subscription")
            .expect(1)
            .create_async()
            .await;

        let gateway = RelayGateway::new(RelayClient::new(server.url(), None).with_retries(3, 1));
        let err = gateway.cancel_subscription("sub_missing").await.unwrap_err();

        rejected.assert_async().await;
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn payment_retry_decodes_outcome() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/payments/retry")
            .match_body(Matcher::PartialJson(json!({"strategy": "premium_routing"})))
            .with_status(200)
            .with_body(r#"{"status":"succeeded","amount_cents":150000,"reference":"pi_9"}"#)
            .create_async()
            .await;

        let gateway = RelayGateway::new(RelayClient::new(format!("{}/", server.url()), None));
        let attempt = gateway.retry_payment(&retry_request()).await.unwrap();
        assert_eq!(attempt.recovered_cents(), Some(150_000));
    }

    #[tokio::test]
    async fn empty_body_counts_as_ack() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/sms")
            .with_status(204)
            .create_async()
            .await;

        let notifier = RelayNotifier::new(RelayClient::new(server.url(), None));
        let receipt = notifier.send_sms("+15550100", "hi").await.unwrap();
        assert!(receipt.delivered);
        assert!(receipt.reference.is_none());
    }
}
