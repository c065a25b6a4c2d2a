// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Coachbill Background Worker
//!
//! Handles scheduled jobs including:
//! - Dunning sweep (every minute)
//! - Failed webhook replay (every 15 minutes)
//! - Daily revenue snapshot (00:05 UTC)
//! - Invariant checks (hourly)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use coachbill_billing::{
    BillingService, InvariantCheckSummary, SweepReport, ViolationSeverity, WebhookReplayResult,
};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_REPLAY_BATCH: i64 = 50;

/// Log the counts from one dunning sweep
fn log_sweep_report(report: &SweepReport) {
    if report.claimed == 0 {
        return;
    }

    info!(
        claimed = report.claimed,
        advanced = report.advanced,
        recovered = report.recovered,
        exhausted = report.exhausted,
        superseded = report.superseded,
        errors = report.errors,
        "Dunning sweep complete"
    );
}

/// (replayed, still failing)
fn count_replays(results: &[WebhookReplayResult]) -> (usize, usize) {
    let replayed = results.iter().filter(|r| r.success).count();
    (replayed, results.len() - replayed)
}

/// Log results of a failed-webhook replay pass
fn log_replay_results(results: &[WebhookReplayResult]) {
    let (replayed, failed) = count_replays(results);
    info!(replayed = replayed, failed = failed, "Webhook replay cycle complete");

    for result in results.iter().filter(|r| !r.success) {
        warn!(
            event_id = %result.event_id,
            event_type = %result.event_type,
            error = result.new_error.as_deref().unwrap_or("unknown"),
            "Webhook still failing after replay"
        );
    }
}

/// Critical violations go to error, everything else to warn
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "All billing invariants hold");
        return;
    }

    for violation in &summary.violations {
        let customers = violation
            .customer_ids
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(",");
        if violation.severity == ViolationSeverity::Critical {
            error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                customers = %customers,
                "{}",
                violation.description
            );
        } else {
            warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                customers = %customers,
                "{}",
                violation.description
            );
        }
    }

    warn!(
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant check found violations"
    );
}

fn replay_batch_size() -> i64 {
    std::env::var("WEBHOOK_REPLAY_BATCH")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_REPLAY_BATCH)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    coachbill_shared::init_tracing("info,coachbill_worker=debug,coachbill_billing=debug");

    info!("Starting Coachbill Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = coachbill_shared::create_pool(&database_url).await?;

    let billing = Arc::new(BillingService::from_env(pool)?);
    let replay_batch = replay_batch_size();

    let scheduler = JobScheduler::new().await?;

    // Job 1: Dunning sweep (every minute)
    // Leases keep overlapping sweeps from claiming the same campaign
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                match billing.dunning.process_due(OffsetDateTime::now_utc()).await {
                    Ok(report) => log_sweep_report(&report),
                    Err(e) => error!(error = %e, "Dunning sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Dunning sweep (every minute)");

    // Job 2: Replay failed webhooks (every 15 minutes)
    let replay_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = replay_billing.clone();
            Box::pin(async move {
                match billing.webhooks.replay_all_failed(replay_batch).await {
                    Ok(results) if results.is_empty() => {}
                    Ok(results) => log_replay_results(&results),
                    Err(e) => error!(error = %e, "Webhook replay cycle failed"),
                }
            })
        })?)
        .await?;
    info!(batch = replay_batch, "Scheduled: Failed webhook replay (every 15 minutes)");

    // Job 3: Daily revenue snapshot for the previous UTC day (00:05 UTC)
    let snapshot_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 5 0 * * *", move |_uuid, _l| {
            let billing = snapshot_billing.clone();
            Box::pin(async move {
                info!("Running daily revenue snapshot");
                match billing.metrics.snapshot_daily(OffsetDateTime::now_utc()).await {
                    Ok(m) => info!(
                        period_start = %m.period_start,
                        mrr_cents = m.mrr_cents,
                        active_customers = m.active_customers,
                        churned_customers = m.churned_customers,
                        payment_success_rate_pct = m.payment_success_rate_pct,
                        "Revenue snapshot stored"
                    ),
                    Err(e) => error!(error = %e, "Revenue snapshot failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Daily revenue snapshot (00:05 UTC)");

    // Job 4: Invariant checks (hourly)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 * * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                match billing.invariants.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant check failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (hourly)");

    // Job 5: Heartbeat (every 5 minutes)
    let heartbeat_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = heartbeat_billing.clone();
            Box::pin(async move {
                let stats = billing.webhooks.stats();
                info!(
                    webhooks_total = stats.total,
                    webhooks_failed = stats.failed,
                    "Worker heartbeat - all systems operational"
                );
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Coachbill Worker started successfully with {} scheduled jobs", 5);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn replay(event_id: &str, success: bool) -> WebhookReplayResult {
        WebhookReplayResult {
            record_id: Uuid::new_v4(),
            event_id: event_id.to_string(),
            event_type: "invoice.payment_failed".to_string(),
            previous_status: "error".to_string(),
            previous_error: Some("customer not found".to_string()),
            new_status: if success { "success" } else { "error" }.to_string(),
            new_error: (!success).then(|| "customer not found".to_string()),
            success,
        }
    }

    #[test]
    fn replay_counts_split_by_success() {
        let results = vec![replay("evt_1", true), replay("evt_2", false), replay("evt_3", true)];
        assert_eq!(count_replays(&results), (2, 1));
        assert_eq!(count_replays(&[]), (0, 0));
    }

    #[test]
    #[serial]
    fn replay_batch_falls_back_on_bad_values() {
        std::env::remove_var("WEBHOOK_REPLAY_BATCH");
        assert_eq!(replay_batch_size(), DEFAULT_REPLAY_BATCH);

        std::env::set_var("WEBHOOK_REPLAY_BATCH", "0");
        assert_eq!(replay_batch_size(), DEFAULT_REPLAY_BATCH);

        std::env::set_var("WEBHOOK_REPLAY_BATCH", "many");
        assert_eq!(replay_batch_size(), DEFAULT_REPLAY_BATCH);

        std::env::set_var("WEBHOOK_REPLAY_BATCH", "200");
        assert_eq!(replay_batch_size(), 200);

        std::env::remove_var("WEBHOOK_REPLAY_BATCH");
    }
}
