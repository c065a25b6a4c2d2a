//! Revenue metrics
//!
//! Recurring revenue, customer and payment figures for a reporting window,
//! aggregated in SQL and combined here. `snapshot_daily` stores one row per
//! day for trend charts.

use serde::Serialize;
use sqlx::PgPool;
use time::{Date, OffsetDateTime};

use crate::dunning::analytics::round2;
use crate::error::BillingResult;
use crate::plans::BillingInterval;

/// Metric type stored with daily snapshots
pub const DAILY_METRIC_TYPE: &str = "daily";

/// Recurring revenue grouped by billing interval
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IntervalRevenue {
    #[sqlx(try_from = "String")]
    pub billing_interval: BillingInterval,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct CustomerAggregates {
    pub active_customers: i64,
    pub new_customers: i64,
    pub churned_customers: i64,
    pub avg_ltv_cents: Option<f64>,
    pub avg_churn_risk: Option<f64>,
}

#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct PaymentAggregates {
    pub successful_payments: i64,
    pub failed_payments: i64,
    pub total_revenue_cents: i64,
    pub avg_transaction_cents: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevenueMetrics {
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub mrr_cents: i64,
    pub arr_cents: i64,
    pub total_revenue_cents: i64,
    pub avg_transaction_cents: i64,
    pub active_customers: i64,
    pub new_customers: i64,
    pub churned_customers: i64,
    pub churn_rate_pct: f64,
    pub avg_ltv_cents: i64,
    pub avg_churn_risk: f64,
    pub successful_payments: i64,
    pub failed_payments: i64,
    pub payment_success_rate_pct: f64,
}

fn pct(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        0.0
    } else {
        round2(part as f64 / whole as f64 * 100.0)
    }
}

impl RevenueMetrics {
    /// Combine the raw aggregates; every ratio with an empty denominator is 0
    pub fn from_aggregates(
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        recurring: &[IntervalRevenue],
        customers: &CustomerAggregates,
        payments: &PaymentAggregates,
    ) -> Self {
        let mrr_cents: i64 = recurring
            .iter()
            .map(|r| r.billing_interval.monthly_amount(r.amount_cents))
            .sum();

        Self {
            period_start,
            period_end,
            mrr_cents,
            arr_cents: mrr_cents * 12,
            total_revenue_cents: payments.total_revenue_cents,
            avg_transaction_cents: payments.avg_transaction_cents.unwrap_or(0.0).round() as i64,
            active_customers: customers.active_customers,
            new_customers: customers.new_customers,
            churned_customers: customers.churned_customers,
            churn_rate_pct: pct(
                customers.churned_customers,
                customers.active_customers + customers.churned_customers,
            ),
            avg_ltv_cents: customers.avg_ltv_cents.unwrap_or(0.0).round() as i64,
            avg_churn_risk: round2(customers.avg_churn_risk.unwrap_or(0.0)),
            successful_payments: payments.successful_payments,
            failed_payments: payments.failed_payments,
            payment_success_rate_pct: pct(
                payments.successful_payments,
                payments.successful_payments + payments.failed_payments,
            ),
        }
    }
}

#[derive(Clone)]
pub struct MetricsService {
    pool: PgPool,
}

impl MetricsService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn compute(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<RevenueMetrics> {
        let recurring: Vec<IntervalRevenue> = sqlx::query_as(
            r#"
            SELECT billing_interval,
                   COALESCE(SUM(unit_amount_cents * quantity), 0)::BIGINT AS amount_cents
            FROM subscriptions
            WHERE status = 'active'
            GROUP BY billing_interval
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let customers: CustomerAggregates = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE lifecycle_stage = 'active') AS active_customers,
                COUNT(*) FILTER (WHERE created_at >= $1) AS new_customers,
                COUNT(*) FILTER (WHERE lifecycle_stage = 'churned' AND updated_at >= $1) AS churned_customers,
                AVG(total_lifetime_value_cents)::DOUBLE PRECISION AS avg_ltv_cents,
                AVG(churn_risk_score) AS avg_churn_risk
            FROM customers
            WHERE created_at <= $2
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let payments: PaymentAggregates = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'succeeded') AS successful_payments,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed_payments,
                COALESCE(SUM(amount_cents) FILTER (WHERE status = 'succeeded'), 0)::BIGINT AS total_revenue_cents,
                (AVG(amount_cents) FILTER (WHERE status = 'succeeded'))::DOUBLE PRECISION AS avg_transaction_cents
            FROM payment_transactions
            WHERE created_at BETWEEN $1 AND $2
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(RevenueMetrics::from_aggregates(
            start, end, &recurring, &customers, &payments,
        ))
    }

    /// Compute the metrics for the day before `now` and store them
    pub async fn snapshot_daily(&self, now: OffsetDateTime) -> BillingResult<RevenueMetrics> {
        let day_end = now.replace_time(time::Time::MIDNIGHT);
        let day_start = day_end - time::Duration::days(1);
        let metrics = self.compute(day_start, day_end).await?;
        self.store_snapshot(day_start.date(), &metrics).await?;

        tracing::info!(
            metric_date = %day_start.date(),
            mrr_cents = metrics.mrr_cents,
            active_customers = metrics.active_customers,
            "Revenue snapshot stored"
        );
        Ok(metrics)
    }

    async fn store_snapshot(&self, date: Date, metrics: &RevenueMetrics) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO revenue_metrics (
                metric_date, metric_type, mrr_cents, arr_cents, active_customers, new_customers,
                churned_customers, total_revenue_cents, successful_payments, failed_payments,
                payment_success_rate, avg_transaction_cents, avg_ltv_cents
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (metric_date, metric_type) DO UPDATE SET
                mrr_cents = EXCLUDED.mrr_cents,
                arr_cents = EXCLUDED.arr_cents,
                active_customers = EXCLUDED.active_customers,
                new_customers = EXCLUDED.new_customers,
                churned_customers = EXCLUDED.churned_customers,
                total_revenue_cents = EXCLUDED.total_revenue_cents,
                successful_payments = EXCLUDED.successful_payments,
                failed_payments = EXCLUDED.failed_payments,
                payment_success_rate = EXCLUDED.payment_success_rate,
                avg_transaction_cents = EXCLUDED.avg_transaction_cents,
                avg_ltv_cents = EXCLUDED.avg_ltv_cents
            "#,
        )
        .bind(date)
        .bind(DAILY_METRIC_TYPE)
        .bind(metrics.mrr_cents)
        .bind(metrics.arr_cents)
        .bind(metrics.active_customers)
        .bind(metrics.new_customers)
        .bind(metrics.churned_customers)
        .bind(metrics.total_revenue_cents)
        .bind(metrics.successful_payments)
        .bind(metrics.failed_payments)
        .bind(metrics.payment_success_rate_pct)
        .bind(metrics.avg_transaction_cents)
        .bind(metrics.avg_ltv_cents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const START: OffsetDateTime = datetime!(2026-05-01 0:00 UTC);
    const END: OffsetDateTime = datetime!(2026-05-31 0:00 UTC);

    #[test]
    fn mrr_normalizes_intervals() {
        let recurring = vec![
            IntervalRevenue {
                billing_interval: BillingInterval::Monthly,
                amount_cents: 500_000 + 9_700,
            },
            IntervalRevenue {
                billing_interval: BillingInterval::Quarterly,
                amount_cents: 450_000,
            },
            IntervalRevenue {
                billing_interval: BillingInterval::Annually,
                amount_cents: 1_200_000,
            },
            IntervalRevenue {
                billing_interval: BillingInterval::OneTime,
                amount_cents: 99_700,
            },
        ];
        let m = RevenueMetrics::from_aggregates(
            START,
            END,
            &recurring,
            &CustomerAggregates::default(),
            &PaymentAggregates::default(),
        );
        assert_eq!(m.mrr_cents, 509_700 + 150_000 + 100_000);
        assert_eq!(m.arr_cents, m.mrr_cents * 12);
    }

    #[test]
    fn rates_are_percentages_rounded_to_two_places() {
        let customers = CustomerAggregates {
            active_customers: 2,
            new_customers: 1,
            churned_customers: 1,
            avg_ltv_cents: Some(123_456.6),
            avg_churn_risk: Some(0.33333),
        };
        let payments = PaymentAggregates {
            successful_payments: 2,
            failed_payments: 1,
            total_revenue_cents: 19_400,
            avg_transaction_cents: Some(9_700.0),
        };
        let m = RevenueMetrics::from_aggregates(START, END, &[], &customers, &payments);
        assert_eq!(m.churn_rate_pct, 33.33);
        assert_eq!(m.payment_success_rate_pct, 66.67);
        assert_eq!(m.avg_ltv_cents, 123_457);
        assert_eq!(m.avg_churn_risk, 0.33);
        assert_eq!(m.avg_transaction_cents, 9_700);
    }

    #[test]
    fn empty_window_yields_zeros() {
        let m = RevenueMetrics::from_aggregates(
            START,
            END,
            &[],
            &CustomerAggregates::default(),
            &PaymentAggregates::default(),
        );
        assert_eq!(m.mrr_cents, 0);
        assert_eq!(m.churn_rate_pct, 0.0);
        assert_eq!(m.payment_success_rate_pct, 0.0);
        assert_eq!(m.avg_transaction_cents, 0);
    }
}
