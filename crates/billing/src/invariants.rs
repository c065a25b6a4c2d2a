//! Billing invariant checks
//!
//! Read-only SQL checks that can be run after a sweep or a webhook replay to
//! confirm the billing and dunning tables are consistent. Each violation
//! carries enough context to find the offending rows.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Customer(s) affected
    pub customer_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Customers may be charged or messaged twice
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateCampaignRow {
    dedupe_key: String,
    customer_ids: Vec<Uuid>,
    campaign_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CampaignRow {
    campaign_id: Uuid,
    customer_id: Uuid,
    status: String,
    current_step: i32,
    total_steps: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledSubscriptionCampaignRow {
    campaign_id: Uuid,
    customer_id: Uuid,
    subscription_id: Uuid,
    campaign_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckWebhookRow {
    event_id: String,
    event_type: String,
    processing_started_at: Option<OffsetDateTime>,
    retry_count: i32,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_open_campaign().await?);
        violations.extend(self.check_campaign_step_in_range().await?);
        violations.extend(self.check_completed_has_timestamp().await?);
        violations.extend(self.check_no_campaign_on_canceled_subscription().await?);
        violations.extend(self.check_no_stuck_webhooks().await?);

        let summary =
            InvariantCheckSummary::from_violations(now, Self::available_checks().len(), violations);
        if !summary.healthy {
            tracing::warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Billing invariant violations found"
            );
        }
        Ok(summary)
    }

    /// At most one active or paused campaign per dedupe key.
    ///
    /// The partial unique index enforces this; a hit means the index is
    /// missing or was bypassed.
    async fn check_single_open_campaign(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateCampaignRow> = sqlx::query_as(
            r#"
            SELECT dedupe_key,
                   ARRAY_AGG(DISTINCT customer_id) AS customer_ids,
                   COUNT(*) AS campaign_count
            FROM dunning_campaigns
            WHERE status IN ('active', 'paused')
            GROUP BY dedupe_key
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_open_campaign".to_string(),
                customer_ids: row.customer_ids,
                description: format!(
                    "{} open dunning campaigns for {} (expected 1)",
                    row.campaign_count, row.dedupe_key
                ),
                context: serde_json::json!({
                    "dedupe_key": row.dedupe_key,
                    "campaign_count": row.campaign_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_campaign_step_in_range(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CampaignRow> = sqlx::query_as(
            r#"
            SELECT id AS campaign_id, customer_id, status, current_step, total_steps
            FROM dunning_campaigns
            WHERE current_step < 1 OR current_step > total_steps
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "campaign_step_in_range".to_string(),
                customer_ids: vec![row.customer_id],
                description: format!(
                    "Campaign is on step {} of {}",
                    row.current_step, row.total_steps
                ),
                context: serde_json::json!({
                    "campaign_id": row.campaign_id,
                    "status": row.status,
                    "current_step": row.current_step,
                    "total_steps": row.total_steps,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_completed_has_timestamp(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CampaignRow> = sqlx::query_as(
            r#"
            SELECT id AS campaign_id, customer_id, status, current_step, total_steps
            FROM dunning_campaigns
            WHERE status IN ('completed', 'failed')
              AND completed_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_has_timestamp".to_string(),
                customer_ids: vec![row.customer_id],
                description: format!("Campaign is {} but has no completed_at", row.status),
                context: serde_json::json!({
                    "campaign_id": row.campaign_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// A canceled subscription has nothing left to recover, so an open
    /// campaign on it would keep messaging a churned customer.
    async fn check_no_campaign_on_canceled_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledSubscriptionCampaignRow> = sqlx::query_as(
            r#"
            SELECT c.id AS campaign_id, c.customer_id, s.id AS subscription_id,
                   c.status AS campaign_status
            FROM dunning_campaigns c
            JOIN subscriptions s ON s.id = c.subscription_id
            WHERE c.status IN ('active', 'paused')
              AND s.status = 'canceled'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_campaign_on_canceled_subscription".to_string(),
                customer_ids: vec![row.customer_id],
                description: format!(
                    "Campaign is {} but its subscription is canceled",
                    row.campaign_status
                ),
                context: serde_json::json!({
                    "campaign_id": row.campaign_id,
                    "subscription_id": row.subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_no_stuck_webhooks(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckWebhookRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, processing_started_at, retry_count
            FROM webhook_events
            WHERE processing_result = 'processing'
              AND processing_started_at < NOW() - INTERVAL '30 minutes'
            ORDER BY processing_started_at
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhooks".to_string(),
                customer_ids: vec![],
                description: format!(
                    "Webhook {} ({}) has been processing since {:?}",
                    row.event_id, row.event_type, row.processing_started_at
                ),
                context: serde_json::json!({
                    "event_id": row.event_id,
                    "event_type": row.event_type,
                    "retry_count": row.retry_count,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_open_campaign" => self.check_single_open_campaign().await,
            "campaign_step_in_range" => self.check_campaign_step_in_range().await,
            "completed_has_timestamp" => self.check_completed_has_timestamp().await,
            "no_campaign_on_canceled_subscription" => {
                self.check_no_campaign_on_canceled_subscription().await
            }
            "no_stuck_webhooks" => self.check_no_stuck_webhooks().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_open_campaign",
            "campaign_step_in_range",
            "completed_has_timestamp",
            "no_campaign_on_canceled_subscription",
            "no_stuck_webhooks",
        ]
    }
}
