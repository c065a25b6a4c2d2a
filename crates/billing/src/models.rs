//! Billing domain rows
//!
//! Customers own subscriptions, subscriptions own invoices, invoices own
//! payment transactions. Status columns are stored as snake_case TEXT and
//! decoded into the enums below.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// Declares a TEXT-backed status enum with string conversions
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::BillingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::error::BillingError::InvalidInput(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = $crate::error::BillingError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

pub(crate) use text_enum;

text_enum!(
    /// Where a customer sits in the relationship lifecycle
    LifecycleStage {
        Prospect => "prospect",
        Trial => "trial",
        Active => "active",
        PastDue => "past_due",
        Churned => "churned",
        Deleted => "deleted",
    }
);

text_enum!(
    SubscriptionStatus {
        Active => "active",
        Trialing => "trialing",
        PastDue => "past_due",
        Canceled => "canceled",
        Unpaid => "unpaid",
        Incomplete => "incomplete",
        IncompleteExpired => "incomplete_expired",
        Paused => "paused",
    }
);

text_enum!(
    InvoiceStatus {
        Draft => "draft",
        Open => "open",
        Paid => "paid",
        Uncollectible => "uncollectible",
        Void => "void",
    }
);

text_enum!(
    PaymentStatus {
        Pending => "pending",
        Succeeded => "succeeded",
        Failed => "failed",
        Canceled => "canceled",
    }
);

impl SubscriptionStatus {
    /// Statuses that still bill the customer
    pub fn is_billable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }

    /// Statuses after which the customer is considered lost
    pub fn is_churned(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled
                | SubscriptionStatus::Unpaid
                | SubscriptionStatus::IncompleteExpired
        )
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub external_customer_id: Option<String>,
    pub billing_address: serde_json::Value,
    pub preferred_currency: String,
    #[sqlx(try_from = "String")]
    pub lifecycle_stage: LifecycleStage,
    pub total_lifetime_value_cents: i64,
    pub churn_risk_score: Option<f64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub last_activity_at: Option<OffsetDateTime>,
}

impl Customer {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub plan_id: String,
    pub external_subscription_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: SubscriptionStatus,
    #[sqlx(try_from = "String")]
    pub billing_interval: crate::plans::BillingInterval,
    pub unit_amount_cents: i64,
    pub currency: String,
    pub quantity: i32,
    pub discount_code: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub external_invoice_id: String,
    #[sqlx(try_from = "String")]
    pub status: InvoiceStatus,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub attempt_count: i32,
    pub next_payment_attempt: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub external_payment_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: PaymentStatus,
    pub failure_code: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Split a display name into first and last name
pub fn split_name(name: &str) -> (String, String) {
    let mut parts = name.split_whitespace();
    let first = parts.next().unwrap_or_default().to_string();
    let rest = parts.collect::<Vec<_>>().join(" ");
    (first, rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::IncompleteExpired,
        ] {
            let parsed: SubscriptionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<InvoiceStatus>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&LifecycleStage::PastDue).unwrap();
        assert_eq!(json, "\"past_due\"");
    }

    #[test]
    fn split_name_handles_multi_part_and_empty() {
        assert_eq!(
            split_name("Ada King Lovelace"),
            ("Ada".to_string(), "King Lovelace".to_string())
        );
        assert_eq!(split_name("Plato"), ("Plato".to_string(), String::new()));
        assert_eq!(split_name("   "), (String::new(), String::new()));
    }

    #[test]
    fn churned_statuses() {
        assert!(SubscriptionStatus::Canceled.is_churned());
        assert!(SubscriptionStatus::Unpaid.is_churned());
        assert!(!SubscriptionStatus::PastDue.is_churned());
        assert!(SubscriptionStatus::PastDue.is_billable());
    }

    // Expands in a module that imports nothing, as plans.rs and
    // subscriptions.rs do
    mod bare_scope {
        crate::models::text_enum!(
            Cadence {
                Weekly => "weekly",
                Fortnightly => "fortnightly",
            }
        );

        #[test]
        fn macro_resolves_its_own_paths() {
            let parsed: Cadence = "fortnightly".parse().unwrap();
            assert_eq!(parsed, Cadence::Fortnightly);
            assert_eq!(serde_json::to_string(&Cadence::Weekly).unwrap(), "\"weekly\"");

            let err = Cadence::try_from("daily".to_string()).unwrap_err();
            assert!(matches!(err, crate::error::BillingError::InvalidInput(_)));
        }
    }
}
