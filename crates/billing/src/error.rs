//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(uuid::Uuid),

    #[error("Unknown plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Webhook event type not supported: {0}")]
    WebhookEventNotSupported(String),

    /// Another worker changed the row between our read and our write
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Campaign {campaign_id} is {status}, expected {expected}")]
    InvalidCampaignState {
        campaign_id: uuid::Uuid,
        status: String,
        expected: String,
    },

    /// Transient failure talking to a payment or messaging provider
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether retrying the same operation later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_)
                | BillingError::Provider(_)
                | BillingError::ConcurrentModification(_)
        )
    }

    /// The event body itself is unusable; redelivering it cannot help
    pub fn is_malformed_payload(&self) -> bool {
        matches!(
            self,
            BillingError::WebhookPayloadInvalid(_) | BillingError::InvalidInput(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::WebhookPayloadInvalid(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Provider(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(BillingError::Database("timeout".into()).is_transient());
        assert!(BillingError::Provider("502".into()).is_transient());
        assert!(!BillingError::WebhookSignatureInvalid.is_transient());
        assert!(!BillingError::InvalidPlan("gold".into()).is_transient());
    }

    #[test]
    fn payload_errors_are_not_worth_redelivering() {
        let bad_json: BillingError = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert!(bad_json.is_malformed_payload());
        assert!(BillingError::InvalidInput("missing customer".into()).is_malformed_payload());
        assert!(!BillingError::Database("timeout".into()).is_malformed_payload());
        assert!(!BillingError::NotFound("customer cus_1".into()).is_malformed_payload());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}
