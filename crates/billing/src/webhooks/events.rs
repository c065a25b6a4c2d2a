//! Processor event envelope and the objects we read from it

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::{InvoiceStatus, SubscriptionStatus};
use crate::plans::BillingInterval;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_attributes: Option<serde_json::Value>,
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(error = %e, "Webhook payload is not a valid event");
            BillingError::WebhookPayloadInvalid(e.to_string())
        })
    }

    /// Decode `data.object` as the type the event carries
    pub fn object<T: DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookPayloadInvalid(format!(
                "{} object could not be decoded: {e}",
                self.event_type
            ))
        })
    }

    pub fn created_at(&self) -> OffsetDateTime {
        timestamp(self.created).unwrap_or_else(OffsetDateTime::now_utc)
    }
}

pub fn timestamp(secs: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).ok()
}

fn opt_timestamp(secs: Option<i64>) -> Option<OffsetDateTime> {
    secs.and_then(timestamp)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerObject {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<serde_json::Value>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recurring {
    pub interval: String,
    #[serde(default)]
    pub interval_count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceObject {
    pub id: String,
    pub unit_amount: Option<i64>,
    pub currency: Option<String>,
    pub recurring: Option<Recurring>,
    pub lookup_key: Option<String>,
}

impl PriceObject {
    pub fn interval(&self) -> BillingInterval {
        match &self.recurring {
            None => BillingInterval::OneTime,
            Some(r) => match (r.interval.as_str(), r.interval_count.unwrap_or(1)) {
                ("year", _) => BillingInterval::Annually,
                ("month", 3) => BillingInterval::Quarterly,
                ("month", 12) => BillingInterval::Annually,
                _ => BillingInterval::Monthly,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    pub price: PriceObject,
    pub quantity: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: String,
    pub status: String,
    pub items: ItemList,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub trial_start: Option<i64>,
    pub trial_end: Option<i64>,
    pub cancel_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl SubscriptionObject {
    pub fn first_item(&self) -> BillingResult<&SubscriptionItem> {
        self.items.data.first().ok_or_else(|| {
            BillingError::WebhookPayloadInvalid(format!("subscription {} has no items", self.id))
        })
    }

    /// Plan id from metadata, else the price lookup key, else the price id
    pub fn plan_id(&self) -> BillingResult<String> {
        if let Some(plan) = self.metadata.get("plan_id").filter(|p| !p.is_empty()) {
            return Ok(plan.clone());
        }
        let price = &self.first_item()?.price;
        Ok(price.lookup_key.clone().unwrap_or_else(|| price.id.clone()))
    }

    pub fn status(&self) -> BillingResult<SubscriptionStatus> {
        self.status.parse().map_err(|_| {
            BillingError::WebhookPayloadInvalid(format!(
                "unknown subscription status {}",
                self.status
            ))
        })
    }

    pub fn period_start(&self) -> Option<OffsetDateTime> {
        opt_timestamp(self.current_period_start)
    }
    pub fn period_end(&self) -> Option<OffsetDateTime> {
        opt_timestamp(self.current_period_end)
    }
    pub fn trial_start_at(&self) -> Option<OffsetDateTime> {
        opt_timestamp(self.trial_start)
    }
    pub fn trial_end_at(&self) -> Option<OffsetDateTime> {
        opt_timestamp(self.trial_end)
    }
    pub fn cancel_at_time(&self) -> Option<OffsetDateTime> {
        opt_timestamp(self.cancel_at)
    }
    pub fn canceled_at_time(&self) -> Option<OffsetDateTime> {
        opt_timestamp(self.canceled_at)
    }
    pub fn ended_at_time(&self) -> Option<OffsetDateTime> {
        opt_timestamp(self.ended_at)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentError {
    pub code: Option<String>,
    pub decline_code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    pub customer: String,
    pub subscription: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub amount_paid: i64,
    pub currency: Option<String>,
    #[serde(default)]
    pub attempt_count: i32,
    pub next_payment_attempt: Option<i64>,
    pub payment_intent: Option<String>,
    pub charge: Option<String>,
    pub last_payment_error: Option<PaymentError>,
}

impl InvoiceObject {
    pub fn status_or(&self, fallback: InvoiceStatus) -> InvoiceStatus {
        self.status
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(fallback)
    }

    pub fn currency(&self) -> String {
        self.currency
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_else(|| "USD".to_string())
    }

    pub fn payment_ref(&self) -> Option<String> {
        self.payment_intent.clone().or_else(|| self.charge.clone())
    }

    pub fn next_attempt_at(&self) -> Option<OffsetDateTime> {
        opt_timestamp(self.next_payment_attempt)
    }

    pub fn failure_code(&self) -> Option<String> {
        self.last_payment_error
            .as_ref()
            .and_then(|e| e.decline_code.clone().or_else(|| e.code.clone()))
    }

    pub fn failure_message(&self) -> Option<String> {
        self.last_payment_error.as_ref().and_then(|e| e.message.clone())
    }
}

/// Card or source reported by `customer.source.expiring`
#[derive(Debug, Clone, Deserialize)]
pub struct ExpiringSourceObject {
    pub id: String,
    pub customer: Option<String>,
    pub exp_month: u8,
    pub exp_year: i32,
    pub last4: Option<String>,
    pub brand: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(object: serde_json::Value, ty: &str) -> WebhookEvent {
        WebhookEvent::parse(
            &json!({
                "id": "evt_1",
                "type": ty,
                "created": 1_780_000_000,
                "data": { "object": object }
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn subscription_plan_resolution() {
        let mut obj = json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "active",
            "items": { "data": [{
                "price": { "id": "price_123", "unit_amount": 9700, "currency": "usd",
                           "recurring": { "interval": "month", "interval_count": 3 },
                           "lookup_key": "community_access" },
                "quantity": 1
            }]},
            "metadata": { "plan_id": "elite_coaching" }
        });
        let sub: SubscriptionObject = event(obj.clone(), "customer.subscription.created")
            .object()
            .unwrap();
        assert_eq!(sub.plan_id().unwrap(), "elite_coaching");
        assert_eq!(sub.first_item().unwrap().price.interval(), BillingInterval::Quarterly);

        obj["metadata"] = json!({});
        let sub: SubscriptionObject = event(obj.clone(), "x").object().unwrap();
        assert_eq!(sub.plan_id().unwrap(), "community_access");

        obj["items"]["data"][0]["price"]["lookup_key"] = serde_json::Value::Null;
        let sub: SubscriptionObject = event(obj, "x").object().unwrap();
        assert_eq!(sub.plan_id().unwrap(), "price_123");
    }

    #[test]
    fn unknown_subscription_status_is_payload_error() {
        let sub: SubscriptionObject = event(
            json!({"id": "sub_1", "customer": "cus_1", "status": "zombie", "items": {"data": []}}),
            "x",
        )
        .object()
        .unwrap();
        assert!(matches!(sub.status(), Err(BillingError::WebhookPayloadInvalid(_))));
        assert!(sub.first_item().is_err());
    }

    #[test]
    fn invoice_failure_details() {
        let inv: InvoiceObject = event(
            json!({
                "id": "in_1", "customer": "cus_1", "subscription": "sub_1",
                "amount_due": 9700, "currency": "usd", "attempt_count": 2,
                "last_payment_error": { "code": "card_declined", "decline_code": "insufficient_funds",
                                        "message": "Your card has insufficient funds." }
            }),
            "invoice.payment_failed",
        )
        .object()
        .unwrap();
        assert_eq!(inv.failure_code().as_deref(), Some("insufficient_funds"));
        assert_eq!(inv.currency(), "USD");
        assert_eq!(inv.status_or(InvoiceStatus::Open), InvoiceStatus::Open);
    }

    #[test]
    fn non_recurring_price_is_one_time() {
        let price = PriceObject {
            id: "price_1".into(),
            unit_amount: Some(99_700),
            currency: None,
            recurring: None,
            lookup_key: None,
        };
        assert_eq!(price.interval(), BillingInterval::OneTime);
    }

    #[test]
    fn garbage_payload_is_rejected() {
        assert!(matches!(
            WebhookEvent::parse("not json"),
            Err(BillingError::WebhookPayloadInvalid(_))
        ));
        assert!(WebhookEvent::parse(r#"{"id":"evt_1"}"#).is_err());
    }
}
