//! Template selection and recovery probability

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use super::campaign::{CampaignKind, TemplateId};

/// Base probability before any customer signal is applied
pub const BASE_PROBABILITY: f64 = 0.65;
/// Ceiling applied after all bonuses
pub const MAX_PROBABILITY: f64 = 0.95;

/// $3,000 per month
const HIGH_VALUE_MONTHLY_CENTS: i64 = 300_000;
/// $10,000 lifetime
const HIGH_VALUE_LTV_CENTS: i64 = 1_000_000;
/// $5,000 lifetime
const LOYAL_LTV_CENTS: i64 = 500_000;

/// Facts about a customer that drive campaign selection
#[derive(Debug, Clone, Default, Serialize)]
pub struct CustomerProfile {
    pub customer_since: Option<OffsetDateTime>,
    pub lifetime_value_cents: i64,
    /// Monthly value of the subscription the campaign is about
    pub monthly_value_cents: i64,
    pub churn_risk_score: Option<f64>,
    pub successful_payments: i64,
    pub failed_payments: i64,
    /// Share of this customer's past campaigns that recovered payment
    pub past_recovery_rate: Option<f64>,
}

impl CustomerProfile {
    pub fn tenure(&self, now: OffsetDateTime) -> Duration {
        self.customer_since
            .map(|since| now - since)
            .unwrap_or(Duration::ZERO)
    }
}

/// Choose the step template for a new campaign
pub fn select_template(profile: &CustomerProfile, kind: CampaignKind) -> TemplateId {
    if profile.monthly_value_cents >= HIGH_VALUE_MONTHLY_CENTS
        || profile.lifetime_value_cents >= HIGH_VALUE_LTV_CENTS
    {
        TemplateId::HighValueCustomer
    } else if kind == CampaignKind::CardExpiring {
        TemplateId::ExpiringCards
    } else {
        TemplateId::FailedPaymentStandard
    }
}

/// Estimate how likely the campaign is to recover payment
pub fn success_probability(profile: &CustomerProfile, now: OffsetDateTime) -> f64 {
    let mut p = BASE_PROBABILITY;

    if profile.tenure(now) > Duration::days(365) {
        p += 0.10;
    }
    if profile.lifetime_value_cents > LOYAL_LTV_CENTS {
        p += 0.15;
    }
    if profile.churn_risk_score.is_some_and(|risk| risk < 0.3) {
        p += 0.12;
    }
    if profile.successful_payments > 10 && profile.failed_payments < 3 {
        p += 0.08;
    }
    if profile.past_recovery_rate.is_some_and(|rate| rate > 0.5) {
        p += 0.10;
    }

    p.min(MAX_PROBABILITY).clamp(0.0, 1.0)
}
