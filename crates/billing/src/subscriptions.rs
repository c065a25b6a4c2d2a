//! Subscription management
//!
//! Subscriptions are created locally against the plan catalog and kept in
//! sync with the payment processor through webhooks.

use serde::Deserialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{text_enum, LifecycleStage, Subscription, SubscriptionStatus};
use crate::plans::{BillingInterval, Plan};

const SUBSCRIPTION_COLUMNS: &str = "id, customer_id, plan_id, external_subscription_id, status, \
     billing_interval, unit_amount_cents, currency, quantity, discount_code, current_period_start, \
     current_period_end, trial_start, trial_end, cancel_at, canceled_at, ended_at, created_at, \
     updated_at";

text_enum!(
    DiscountType {
        Percentage => "percentage",
        FixedAmount => "fixed_amount",
    }
);

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Discount {
    pub code: String,
    #[sqlx(try_from = "String")]
    pub discount_type: DiscountType,
    /// Basis points for percentage discounts, cents for fixed ones
    pub value_bps_or_cents: i64,
    /// `None` applies to every plan
    pub applicable_plans: Option<Vec<String>>,
    pub is_active: bool,
    pub valid_until: Option<OffsetDateTime>,
    pub max_redemptions: Option<i32>,
    pub redemptions_count: i32,
}

impl Discount {
    /// Why the code cannot be used for this plan, if it cannot
    pub fn rejection(&self, plan_id: &str, now: OffsetDateTime) -> Option<&'static str> {
        if !self.is_active {
            return Some("inactive");
        }
        if self.valid_until.is_some_and(|until| until < now) {
            return Some("expired");
        }
        if self
            .max_redemptions
            .is_some_and(|max| self.redemptions_count >= max)
        {
            return Some("fully redeemed");
        }
        if let Some(plans) = &self.applicable_plans {
            if !plans.iter().any(|p| p == plan_id) {
                return Some("not applicable to plan");
            }
        }
        None
    }

    /// Discounted amount, never below zero
    pub fn apply(&self, amount_cents: i64) -> i64 {
        let reduced = match self.discount_type {
            DiscountType::Percentage => {
                let bps = self.value_bps_or_cents.clamp(0, 10_000);
                amount_cents - amount_cents * bps / 10_000
            }
            DiscountType::FixedAmount => amount_cents - self.value_bps_or_cents.max(0),
        };
        reduced.max(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscription {
    pub customer_id: Uuid,
    pub plan_id: String,
    #[serde(default)]
    pub discount_code: Option<String>,
}

/// Subscription state as reported by the payment processor
#[derive(Debug, Clone)]
pub struct ExternalSubscription {
    pub external_id: String,
    pub customer_id: Uuid,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub interval: BillingInterval,
    pub unit_amount_cents: i64,
    pub currency: String,
    pub quantity: i32,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
}

/// Dates for a new subscription starting at `now`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialTerms {
    pub status: SubscriptionStatus,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub period_start: OffsetDateTime,
    pub period_end: Option<OffsetDateTime>,
}

impl InitialTerms {
    pub fn for_plan(plan: &Plan, now: OffsetDateTime) -> Self {
        let (status, trial_start, trial_end) = if plan.has_trial() {
            let end = now + time::Duration::days(i64::from(plan.trial_days));
            (SubscriptionStatus::Trialing, Some(now), Some(end))
        } else {
            (SubscriptionStatus::Active, None, None)
        };
        Self {
            status,
            trial_start,
            trial_end,
            period_start: now,
            period_end: plan.interval.period().map(|p| now + p),
        }
    }

    pub fn lifecycle_stage(&self) -> LifecycleStage {
        if self.status == SubscriptionStatus::Trialing {
            LifecycleStage::Trial
        } else {
            LifecycleStage::Active
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_subscription(
        &self,
        request: &CreateSubscription,
    ) -> BillingResult<Subscription> {
        let plan = Plan::find(&request.plan_id)
            .ok_or_else(|| BillingError::InvalidPlan(request.plan_id.clone()))?;
        let now = OffsetDateTime::now_utc();
        let terms = InitialTerms::for_plan(plan, now);

        let mut tx = self.pool.begin().await?;

        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM customers WHERE id = $1")
            .bind(request.customer_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(BillingError::CustomerNotFound(
                request.customer_id.to_string(),
            ));
        }

        let mut unit_amount_cents = plan.price_cents;
        let mut applied_code = None;
        if let Some(code) = request.discount_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            let discount: Option<Discount> = sqlx::query_as(
                r#"
                SELECT code, discount_type, value_bps_or_cents, applicable_plans, is_active,
                       valid_until, max_redemptions, redemptions_count
                FROM discounts WHERE code = $1
                FOR UPDATE
                "#,
            )
            .bind(code)
            .fetch_optional(&mut *tx)
            .await?;

            match discount {
                Some(d) => match d.rejection(plan.id, now) {
                    None => {
                        sqlx::query(
                            "UPDATE discounts SET redemptions_count = redemptions_count + 1 WHERE code = $1",
                        )
                        .bind(&d.code)
                        .execute(&mut *tx)
                        .await?;
                        unit_amount_cents = d.apply(plan.price_cents);
                        applied_code = Some(d.code);
                    }
                    Some(reason) => {
                        tracing::info!(code = %code, plan = %plan.id, reason, "Discount code ignored");
                    }
                },
                None => tracing::info!(code = %code, "Unknown discount code ignored"),
            }
        }

        let sql = format!(
            r#"
            INSERT INTO subscriptions (
                customer_id, plan_id, status, billing_interval, unit_amount_cents, currency,
                quantity, discount_code, current_period_start, current_period_end,
                trial_start, trial_end, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 1, $7, $8, $9, $10, $11, $12, $12)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        let subscription = sqlx::query_as::<_, Subscription>(&sql)
            .bind(request.customer_id)
            .bind(plan.id)
            .bind(terms.status.as_str())
            .bind(plan.interval.as_str())
            .bind(unit_amount_cents)
            .bind(plan.currency)
            .bind(&applied_code)
            .bind(terms.period_start)
            .bind(terms.period_end)
            .bind(terms.trial_start)
            .bind(terms.trial_end)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE customers SET lifecycle_stage = $2, updated_at = $3, last_activity_at = $3 WHERE id = $1",
        )
        .bind(request.customer_id)
        .bind(terms.lifecycle_stage().as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            customer_id = %subscription.customer_id,
            plan = %plan.id,
            status = %subscription.status,
            unit_amount_cents,
            discount = ?applied_code,
            "Subscription created"
        );
        Ok(subscription)
    }

    pub async fn get_subscription(&self, id: Uuid) -> BillingResult<Subscription> {
        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1");
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))
    }

    pub async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE external_subscription_id = $1"
        );
        let subscription = sqlx::query_as::<_, Subscription>(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(subscription)
    }

    pub async fn mark_status(
        &self,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> BillingResult<Subscription> {
        let now = OffsetDateTime::now_utc();
        let sql = format!(
            r#"
            UPDATE subscriptions
            SET status = $2,
                canceled_at = CASE WHEN $2 = 'canceled' THEN COALESCE(canceled_at, $3) ELSE canceled_at END,
                updated_at = $3
            WHERE id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        let subscription = sqlx::query_as::<_, Subscription>(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))?;

        tracing::info!(subscription_id = %id, status = %status, "Subscription status updated");
        Ok(subscription)
    }

    /// Insert or refresh a subscription from processor state
    pub async fn upsert_external(&self, sub: &ExternalSubscription) -> BillingResult<Subscription> {
        let sql = format!(
            r#"
            INSERT INTO subscriptions (
                customer_id, plan_id, external_subscription_id, status, billing_interval,
                unit_amount_cents, currency, quantity, current_period_start, current_period_end,
                trial_start, trial_end, cancel_at, canceled_at, ended_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW(), NOW())
            ON CONFLICT (external_subscription_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                status = EXCLUDED.status,
                billing_interval = EXCLUDED.billing_interval,
                unit_amount_cents = EXCLUDED.unit_amount_cents,
                currency = EXCLUDED.currency,
                quantity = EXCLUDED.quantity,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                trial_start = EXCLUDED.trial_start,
                trial_end = EXCLUDED.trial_end,
                cancel_at = EXCLUDED.cancel_at,
                canceled_at = COALESCE(EXCLUDED.canceled_at, subscriptions.canceled_at),
                ended_at = COALESCE(EXCLUDED.ended_at, subscriptions.ended_at),
                updated_at = NOW()
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        let subscription = sqlx::query_as::<_, Subscription>(&sql)
            .bind(sub.customer_id)
            .bind(&sub.plan_id)
            .bind(&sub.external_id)
            .bind(sub.status.as_str())
            .bind(sub.interval.as_str())
            .bind(sub.unit_amount_cents)
            .bind(&sub.currency)
            .bind(sub.quantity)
            .bind(sub.current_period_start)
            .bind(sub.current_period_end)
            .bind(sub.trial_start)
            .bind(sub.trial_end)
            .bind(sub.cancel_at)
            .bind(sub.canceled_at)
            .bind(sub.ended_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-06-01 00:00 UTC);

    fn discount(kind: DiscountType, value: i64) -> Discount {
        Discount {
            code: "WELCOME".into(),
            discount_type: kind,
            value_bps_or_cents: value,
            applicable_plans: None,
            is_active: true,
            valid_until: None,
            max_redemptions: None,
            redemptions_count: 0,
        }
    }

    #[test]
    fn percentage_and_fixed_discounts() {
        assert_eq!(discount(DiscountType::Percentage, 2_000).apply(9_700), 7_760);
        assert_eq!(discount(DiscountType::FixedAmount, 2_500).apply(9_700), 7_200);
        assert_eq!(discount(DiscountType::FixedAmount, 20_000).apply(9_700), 0);
        assert_eq!(discount(DiscountType::Percentage, 15_000).apply(9_700), 0);
    }

    #[test]
    fn discount_rejections() {
        let mut d = discount(DiscountType::Percentage, 1_000);
        assert_eq!(d.rejection("community_access", NOW), None);

        d.applicable_plans = Some(vec!["elite_coaching".into()]);
        assert_eq!(
            d.rejection("community_access", NOW),
            Some("not applicable to plan")
        );
        assert_eq!(d.rejection("elite_coaching", NOW), None);

        d.max_redemptions = Some(5);
        d.redemptions_count = 5;
        assert_eq!(d.rejection("elite_coaching", NOW), Some("fully redeemed"));

        d.redemptions_count = 0;
        d.valid_until = Some(datetime!(2026-05-31 23:59 UTC));
        assert_eq!(d.rejection("elite_coaching", NOW), Some("expired"));

        d.is_active = false;
        assert_eq!(d.rejection("elite_coaching", NOW), Some("inactive"));
    }

    #[test]
    fn trial_plans_start_trialing() {
        let plan = Plan::find("group_coaching").unwrap();
        let terms = InitialTerms::for_plan(plan, NOW);
        assert_eq!(terms.status, SubscriptionStatus::Trialing);
        assert_eq!(terms.trial_end, Some(datetime!(2026-06-15 00:00 UTC)));
        assert_eq!(terms.period_end, Some(datetime!(2026-07-01 00:00 UTC)));
        assert_eq!(terms.lifecycle_stage(), LifecycleStage::Trial);
    }

    #[test]
    fn one_time_purchase_is_active_without_period_end() {
        let plan = Plan::find("self_paced_course").unwrap();
        let terms = InitialTerms::for_plan(plan, NOW);
        assert_eq!(terms.status, SubscriptionStatus::Active);
        assert!(terms.trial_start.is_none());
        assert!(terms.period_end.is_none());
        assert_eq!(terms.lifecycle_stage(), LifecycleStage::Active);
    }
}
