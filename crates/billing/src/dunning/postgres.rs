//! Postgres-backed campaign store

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::campaign::{
    Campaign, CampaignInsert, CampaignOutcome, CampaignStatus, DunningActionRecord, NewCampaign,
};
use super::scoring::CustomerProfile;
use super::store::{CampaignContext, CampaignStore, NewAction};
use crate::error::{BillingError, BillingResult};
use crate::plans::{BillingInterval, Plan};

const CAMPAIGN_COLUMNS: &str = "id, customer_id, subscription_id, dedupe_key, campaign_kind, \
     template, status, current_step, total_steps, anchor_at, next_action_at, success_probability, \
     trigger_data, recovered_cents, failure_reason, locked_until, started_at, completed_at";

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    created_at: OffsetDateTime,
    total_lifetime_value_cents: i64,
    churn_risk_score: Option<f64>,
    successful_payments: i64,
    failed_payments: i64,
    past_recovery_rate: Option<f64>,
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionValueRow {
    #[sqlx(try_from = "String")]
    billing_interval: BillingInterval,
    unit_amount_cents: i64,
    quantity: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct ContextRow {
    email: String,
    first_name: String,
    last_name: String,
    phone: Option<String>,
    external_customer_id: Option<String>,
    preferred_currency: String,
    plan_id: Option<String>,
    external_subscription_id: Option<String>,
    unit_amount_cents: Option<i64>,
    quantity: Option<i32>,
    subscription_currency: Option<String>,
}

#[derive(Clone)]
pub struct PgCampaignStore {
    pool: PgPool,
}

impl PgCampaignStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignStore for PgCampaignStore {
    async fn customer_profile(
        &self,
        customer_id: Uuid,
        subscription_id: Option<Uuid>,
    ) -> BillingResult<CustomerProfile> {
        let row: ProfileRow = sqlx::query_as(
            r#"
            SELECT
                c.created_at,
                c.total_lifetime_value_cents,
                c.churn_risk_score,
                (SELECT COUNT(*) FROM payment_transactions p
                  WHERE p.customer_id = c.id AND p.status = 'succeeded') AS successful_payments,
                (SELECT COUNT(*) FROM payment_transactions p
                  WHERE p.customer_id = c.id AND p.status = 'failed') AS failed_payments,
                (SELECT AVG(CASE WHEN d.recovered_cents > 0 THEN 1.0 ELSE 0.0 END)::float8
                   FROM dunning_campaigns d
                  WHERE d.customer_id = c.id
                    AND d.status IN ('completed', 'failed')) AS past_recovery_rate
            FROM customers c
            WHERE c.id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))?;

        let monthly_value_cents = match subscription_id {
            Some(sub_id) => {
                let sub: Option<SubscriptionValueRow> = sqlx::query_as(
                    "SELECT billing_interval, unit_amount_cents, quantity FROM subscriptions WHERE id = $1",
                )
                .bind(sub_id)
                .fetch_optional(&self.pool)
                .await?;
                sub.map(|s| {
                    s.billing_interval
                        .monthly_amount(s.unit_amount_cents * i64::from(s.quantity))
                })
                .unwrap_or(0)
            }
            None => 0,
        };

        Ok(CustomerProfile {
            customer_since: Some(row.created_at),
            lifetime_value_cents: row.total_lifetime_value_cents,
            monthly_value_cents,
            churn_risk_score: row.churn_risk_score,
            successful_payments: row.successful_payments,
            failed_payments: row.failed_payments,
            past_recovery_rate: row.past_recovery_rate,
        })
    }

    async fn insert_campaign(&self, new: NewCampaign) -> BillingResult<CampaignInsert> {
        let template = new.template.template();
        let sql = format!(
            r#"
            INSERT INTO dunning_campaigns (
                customer_id, subscription_id, dedupe_key, campaign_kind, template, status,
                current_step, total_steps, anchor_at, next_action_at, success_probability,
                trigger_data, started_at
            )
            VALUES ($1, $2, $3, $4, $5, 'active', 1, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (dedupe_key) WHERE status IN ('active', 'paused') DO NOTHING
            RETURNING {CAMPAIGN_COLUMNS}
            "#
        );

        // The open campaign that beat us may close before we read it back
        for _ in 0..2 {
            let inserted = sqlx::query_as::<_, Campaign>(&sql)
                .bind(new.customer_id)
                .bind(new.subscription_id)
                .bind(&new.dedupe_key)
                .bind(template.kind.as_str())
                .bind(new.template.as_str())
                .bind(template.total_steps())
                .bind(new.anchor_at)
                .bind(new.next_action_at)
                .bind(new.success_probability)
                .bind(Json(&new.trigger))
                .bind(new.started_at)
                .fetch_optional(&self.pool)
                .await?;

            if let Some(campaign) = inserted {
                return Ok(CampaignInsert::Created(campaign));
            }
            if let Some(existing) = self.open_campaign_by_key(&new.dedupe_key).await? {
                return Ok(CampaignInsert::AlreadyOpen(existing));
            }
        }

        Err(BillingError::ConcurrentModification(format!(
            "open campaign for {} changed during insert",
            new.dedupe_key
        )))
    }

    async fn get_campaign(&self, id: Uuid) -> BillingResult<Option<Campaign>> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM dunning_campaigns WHERE id = $1");
        let campaign = sqlx::query_as::<_, Campaign>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(campaign)
    }

    async fn open_campaign_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Campaign>> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM dunning_campaigns \
             WHERE subscription_id = $1 AND status IN ('active', 'paused') \
             ORDER BY started_at DESC LIMIT 1"
        );
        let campaign = sqlx::query_as::<_, Campaign>(&sql)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(campaign)
    }

    async fn open_campaign_by_key(&self, dedupe_key: &str) -> BillingResult<Option<Campaign>> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM dunning_campaigns \
             WHERE dedupe_key = $1 AND status IN ('active', 'paused')"
        );
        let campaign = sqlx::query_as::<_, Campaign>(&sql)
            .bind(dedupe_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(campaign)
    }

    async fn claim_due(
        &self,
        now: OffsetDateTime,
        lease: Duration,
        limit: i64,
    ) -> BillingResult<Vec<Campaign>> {
        let sql = format!(
            r#"
            UPDATE dunning_campaigns
            SET locked_until = $2
            WHERE id IN (
                SELECT id FROM dunning_campaigns
                WHERE status = 'active'
                  AND next_action_at <= $1
                  AND (locked_until IS NULL OR locked_until <= $1)
                ORDER BY next_action_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {CAMPAIGN_COLUMNS}
            "#
        );
        let mut claimed = sqlx::query_as::<_, Campaign>(&sql)
            .bind(now)
            .bind(now + lease)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        claimed.sort_by_key(|c| c.next_action_at);
        Ok(claimed)
    }

    async fn campaign_context(&self, campaign: &Campaign) -> BillingResult<CampaignContext> {
        let row: ContextRow = sqlx::query_as(
            r#"
            SELECT
                c.email, c.first_name, c.last_name, c.phone, c.external_customer_id,
                c.preferred_currency,
                s.plan_id, s.external_subscription_id, s.unit_amount_cents, s.quantity,
                s.currency AS subscription_currency
            FROM customers c
            LEFT JOIN subscriptions s ON s.id = $2
            WHERE c.id = $1
            "#,
        )
        .bind(campaign.customer_id)
        .bind(campaign.subscription_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::CustomerNotFound(campaign.customer_id.to_string()))?;

        let subscription_amount = row
            .unit_amount_cents
            .map(|unit| unit * i64::from(row.quantity.unwrap_or(1)));
        let amount_cents = campaign
            .trigger
            .amount_cents()
            .or(subscription_amount)
            .unwrap_or(0);

        Ok(CampaignContext {
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            phone: row.phone,
            customer_ref: row.external_customer_id,
            subscription_ref: row.external_subscription_id,
            plan_name: row
                .plan_id
                .as_deref()
                .map(|id| Plan::find(id).map_or_else(|| id.to_string(), |p| p.name.to_string())),
            amount_cents,
            currency: row.subscription_currency.unwrap_or(row.preferred_currency),
        })
    }

    async fn record_action(&self, action: NewAction) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO dunning_actions
                (campaign_id, step_number, action_type, success, detail, executed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (campaign_id, step_number) DO NOTHING
            "#,
        )
        .bind(action.campaign_id)
        .bind(action.step_number)
        .bind(action.action_type.as_str())
        .bind(action.success)
        .bind(&action.detail)
        .bind(action.executed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn advance(
        &self,
        id: Uuid,
        expected_step: i32,
        next_step: i32,
        next_action_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dunning_campaigns
            SET current_step = $3, next_action_at = $4, locked_until = NULL
            WHERE id = $1 AND current_step = $2 AND status = 'active'
            "#,
        )
        .bind(id)
        .bind(expected_step)
        .bind(next_step)
        .bind(next_action_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: Uuid,
        outcome: &CampaignOutcome,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dunning_campaigns
            SET status = $2, recovered_cents = $3, failure_reason = $4,
                completed_at = $5, locked_until = NULL
            WHERE id = $1 AND status IN ('active', 'paused')
            "#,
        )
        .bind(id)
        .bind(outcome.status().as_str())
        .bind(outcome.recovered_cents())
        .bind(outcome.reason())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_status(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
        next_action_at: Option<OffsetDateTime>,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dunning_campaigns
            SET status = $3,
                next_action_at = COALESCE($4, next_action_at),
                locked_until = NULL
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(next_action_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_subscription_canceled(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        let customer_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', canceled_at = COALESCE(canceled_at, $2), updated_at = $2
            WHERE id = $1
            RETURNING customer_id
            "#,
        )
        .bind(subscription_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(customer_id) = customer_id else {
            return Err(BillingError::SubscriptionNotFound(subscription_id.to_string()));
        };

        sqlx::query(
            "UPDATE customers SET lifecycle_stage = 'churned', updated_at = $2 WHERE id = $1",
        )
        .bind(customer_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn campaigns_started_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<Campaign>> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM dunning_campaigns \
             WHERE started_at >= $1 AND started_at < $2 ORDER BY started_at"
        );
        let campaigns = sqlx::query_as::<_, Campaign>(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        Ok(campaigns)
    }

    async fn actions_for_campaigns(
        &self,
        campaign_ids: &[Uuid],
    ) -> BillingResult<Vec<DunningActionRecord>> {
        if campaign_ids.is_empty() {
            return Ok(Vec::new());
        }
        let actions = sqlx::query_as::<_, DunningActionRecord>(
            r#"
            SELECT id, campaign_id, step_number, action_type, success, detail, executed_at
            FROM dunning_actions
            WHERE campaign_id = ANY($1)
            ORDER BY campaign_id, step_number
            "#,
        )
        .bind(campaign_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(actions)
    }
}
