//! Coaching plan catalog

use serde::Serialize;
use time::Duration;

use crate::models::text_enum;

text_enum!(
    BillingInterval {
        Monthly => "monthly",
        Quarterly => "quarterly",
        Annually => "annually",
        OneTime => "one_time",
    }
);

impl BillingInterval {
    /// Normalize a per-interval amount to its monthly recurring value.
    ///
    /// One-time purchases contribute nothing to MRR.
    pub fn monthly_amount(&self, amount_cents: i64) -> i64 {
        match self {
            BillingInterval::Monthly => amount_cents,
            BillingInterval::Quarterly => amount_cents / 3,
            BillingInterval::Annually => amount_cents / 12,
            BillingInterval::OneTime => 0,
        }
    }

    /// Length of one billing period, `None` for one-time purchases
    pub fn period(&self) -> Option<Duration> {
        match self {
            BillingInterval::Monthly => Some(Duration::days(30)),
            BillingInterval::Quarterly => Some(Duration::days(91)),
            BillingInterval::Annually => Some(Duration::days(365)),
            BillingInterval::OneTime => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanFeatures {
    pub weekly_sessions: Option<u8>,
    pub group_size: Option<u8>,
    pub priority_support: bool,
    pub community_access: bool,
    pub resource_library: bool,
    pub lifetime_access: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: &'static str,
    pub name: &'static str,
    pub price_cents: i64,
    pub currency: &'static str,
    pub interval: BillingInterval,
    pub trial_days: u16,
    pub features: PlanFeatures,
}

static PLANS: [Plan; 4] = [
    Plan {
        id: "elite_coaching",
        name: "Elite 1:1 Coaching",
        price_cents: 500_000,
        currency: "USD",
        interval: BillingInterval::Monthly,
        trial_days: 7,
        features: PlanFeatures {
            weekly_sessions: Some(4),
            group_size: None,
            priority_support: true,
            community_access: true,
            resource_library: true,
            lifetime_access: false,
        },
    },
    Plan {
        id: "group_coaching",
        name: "Group Coaching Programs",
        price_cents: 150_000,
        currency: "USD",
        interval: BillingInterval::Monthly,
        trial_days: 14,
        features: PlanFeatures {
            weekly_sessions: Some(2),
            group_size: Some(8),
            priority_support: false,
            community_access: true,
            resource_library: true,
            lifetime_access: false,
        },
    },
    Plan {
        id: "community_access",
        name: "Community Access",
        price_cents: 9_700,
        currency: "USD",
        interval: BillingInterval::Monthly,
        trial_days: 30,
        features: PlanFeatures {
            weekly_sessions: None,
            group_size: None,
            priority_support: false,
            community_access: true,
            resource_library: true,
            lifetime_access: false,
        },
    },
    Plan {
        id: "self_paced_course",
        name: "Self-Paced Courses",
        price_cents: 99_700,
        currency: "USD",
        interval: BillingInterval::OneTime,
        trial_days: 0,
        features: PlanFeatures {
            weekly_sessions: None,
            group_size: None,
            priority_support: false,
            community_access: false,
            resource_library: true,
            lifetime_access: true,
        },
    },
];

impl Plan {
    pub fn all() -> &'static [Plan] {
        &PLANS
    }

    pub fn find(id: &str) -> Option<&'static Plan> {
        PLANS.iter().find(|p| p.id == id)
    }

    pub fn has_trial(&self) -> bool {
        self.trial_days > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup() {
        let elite = Plan::find("elite_coaching").unwrap();
        assert_eq!(elite.price_cents, 500_000);
        assert!(elite.has_trial());
        assert!(Plan::find("platinum").is_none());
        assert_eq!(Plan::all().len(), 4);
    }

    #[test]
    fn monthly_normalization() {
        assert_eq!(BillingInterval::Monthly.monthly_amount(9_700), 9_700);
        assert_eq!(BillingInterval::Quarterly.monthly_amount(30_000), 10_000);
        assert_eq!(BillingInterval::Annually.monthly_amount(120_000), 10_000);
        assert_eq!(BillingInterval::OneTime.monthly_amount(99_700), 0);
    }

    #[test]
    fn one_time_has_no_period() {
        assert!(BillingInterval::OneTime.period().is_none());
        assert_eq!(BillingInterval::Monthly.period(), Some(Duration::days(30)));
    }
}
