// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Boundary conditions and race conditions in:
//! - Dunning concurrency (duplicate starts, overlapping sweeps)
//! - Dunning scheduling (late starts, expired cards, catch-up)
//! - Scoring limits
//! - Webhook signatures
//! - Discounts

#[cfg(test)]
mod dunning_concurrency_tests {
    use std::sync::Arc;

    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use crate::config::BillingConfig;
    use crate::dunning::{
        CampaignContext, CampaignStatus, CampaignTrigger, CustomerProfile, DunningEngine,
        InMemoryCampaignStore,
    };
    use crate::providers::recording::{RecordingGateway, RecordingNotifier};

    const NOW: OffsetDateTime = datetime!(2026-06-01 12:00 UTC);

    async fn engine() -> (Arc<DunningEngine>, Arc<InMemoryCampaignStore>, Uuid) {
        let store = Arc::new(InMemoryCampaignStore::new());
        let customer = Uuid::new_v4();
        store
            .add_customer(
                customer,
                CustomerProfile::default(),
                CampaignContext {
                    email: "sam@example.com".into(),
                    first_name: "Sam".into(),
                    last_name: "Rivera".into(),
                    phone: None,
                    customer_ref: Some("cus_9".into()),
                    subscription_ref: Some("sub_9".into()),
                    plan_name: Some("Group Coaching".into()),
                    amount_cents: 150_000,
                    currency: "USD".into(),
                },
            )
            .await;
        let engine = DunningEngine::new(
            store.clone(),
            Arc::new(RecordingGateway::default()),
            Arc::new(RecordingNotifier::default()),
            &BillingConfig::with_secret("whsec_test"),
        );
        (Arc::new(engine), store, customer)
    }

    fn failed_payment() -> CampaignTrigger {
        CampaignTrigger::FailedPayment {
            invoice_id: "in_9".into(),
            amount_cents: 150_000,
            attempt_count: 1,
            failure_code: None,
            failure_message: None,
        }
    }

    // =========================================================================
    // Ten simultaneous payment_failed deliveries open exactly one campaign
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_starts_open_one_campaign() {
        let (engine, _store, customer) = engine().await;
        let subscription = Uuid::new_v4();
        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        for _ in 0..10 {
            let engine = engine.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                engine
                    .start_campaign(customer, Some(subscription), failed_payment(), NOW)
                    .await
                    .unwrap()
            }));
        }

        let mut ids = vec![];
        let mut created = 0;
        for handle in handles {
            let insert = handle.await.unwrap();
            if insert.is_created() {
                created += 1;
            }
            ids.push(insert.into_campaign().id);
        }
        assert_eq!(created, 1, "Exactly one start should create a campaign");
        ids.dedup();
        assert_eq!(ids.len(), 1, "Every caller should see the same campaign");
    }

    // =========================================================================
    // Overlapping sweeps never execute the same step twice
    // =========================================================================
    #[tokio::test]
    async fn test_overlapping_sweeps_claim_once() {
        let (engine, store, customer) = engine().await;
        let campaign = engine
            .start_campaign(customer, Some(Uuid::new_v4()), failed_payment(), NOW)
            .await
            .unwrap()
            .into_campaign();

        let due = NOW + Duration::hours(1);
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = vec![];
        for _ in 0..4 {
            let engine = engine.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                engine.process_due(due).await.unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            claimed += handle.await.unwrap().claimed;
        }
        assert_eq!(claimed, 1);
        assert_eq!(store.actions(campaign.id).await.len(), 1);
        let current = engine.get_campaign(campaign.id).await.unwrap();
        assert_eq!(current.current_step, 2);
    }

    // =========================================================================
    // A lease that has run out can be taken over by the next sweep
    // =========================================================================
    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        use crate::dunning::CampaignStore;

        let (engine, store, customer) = engine().await;
        let campaign = engine
            .start_campaign(customer, Some(Uuid::new_v4()), failed_payment(), NOW)
            .await
            .unwrap()
            .into_campaign();
        let due = NOW + Duration::hours(1);

        // A sweep claims the campaign and then dies before executing it
        let claimed = store.claim_due(due, Duration::minutes(5), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(engine.process_due(due).await.unwrap().claimed, 0);

        let report = engine.process_due(due + Duration::minutes(5)).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.advanced, 1);
        assert_eq!(store.actions(campaign.id).await.len(), 1);
    }

    // =========================================================================
    // A campaign closed by a payment mid-sweep is not advanced afterwards
    // =========================================================================
    #[tokio::test]
    async fn test_resolved_campaign_is_not_advanced_by_stale_snapshot() {
        let (engine, store, customer) = engine().await;
        let subscription = Uuid::new_v4();
        let campaign = engine
            .start_campaign(customer, Some(subscription), failed_payment(), NOW)
            .await
            .unwrap()
            .into_campaign();

        engine
            .resolve_payment(
                customer,
                Some(subscription),
                "in_9",
                150_000,
                NOW + Duration::minutes(30),
            )
            .await
            .unwrap();
        let outcome = engine
            .execute_step(&campaign, NOW + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(outcome, crate::dunning::StepOutcome::Superseded);

        let done = engine.get_campaign(campaign.id).await.unwrap();
        assert_eq!(done.status, CampaignStatus::Completed);
        assert_eq!(done.recovered_cents, 150_000);
        assert_eq!(done.current_step, 1);
        assert!(
            store.actions(campaign.id).await.is_empty(),
            "No step should run after the campaign closed"
        );
    }

    #[tokio::test]
    async fn test_paid_invoice_without_subscription_closes_customer_campaign() {
        let (engine, _store, customer) = engine().await;
        let campaign = engine
            .start_campaign(customer, None, failed_payment(), NOW)
            .await
            .unwrap()
            .into_campaign();

        // A different invoice being paid leaves this one in dunning
        let other = engine
            .resolve_payment(customer, None, "in_other", 150_000, NOW)
            .await
            .unwrap();
        assert_eq!(other, None);

        let closed = engine
            .resolve_payment(customer, None, "in_9", 150_000, NOW + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(closed, Some(campaign.id));
        assert_eq!(
            engine.get_campaign(campaign.id).await.unwrap().status,
            CampaignStatus::Completed
        );

        let report = engine.process_due(NOW + Duration::days(30)).await.unwrap();
        assert_eq!(report.claimed, 0, "A paid invoice must not be dunned again");
    }

    #[tokio::test]
    async fn test_payment_after_subscription_sync_closes_customer_campaign() {
        // The failure arrived before the subscription was known locally
        let (engine, _store, customer) = engine().await;
        let campaign = engine
            .start_campaign(customer, None, failed_payment(), NOW)
            .await
            .unwrap()
            .into_campaign();

        let closed = engine
            .resolve_payment(customer, Some(Uuid::new_v4()), "in_9", 150_000, NOW)
            .await
            .unwrap();
        assert_eq!(closed, Some(campaign.id));
    }
}

#[cfg(test)]
mod dunning_schedule_tests {
    use std::sync::Arc;

    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    use crate::config::BillingConfig;
    use crate::dunning::campaign::dedupe_key;
    use crate::dunning::{
        CampaignContext, CampaignKind, CampaignTrigger, CustomerProfile, DunningEngine,
        InMemoryCampaignStore, TemplateId,
    };
    use crate::error::BillingError;
    use crate::providers::recording::{RecordingGateway, RecordingNotifier};

    const NOW: OffsetDateTime = datetime!(2026-06-01 12:00 UTC);

    async fn engine() -> (DunningEngine, Uuid) {
        let store = Arc::new(InMemoryCampaignStore::new());
        let customer = Uuid::new_v4();
        store
            .add_customer(
                customer,
                CustomerProfile::default(),
                CampaignContext {
                    email: "lee@example.com".into(),
                    first_name: "Lee".into(),
                    last_name: String::new(),
                    phone: Some("+15550199".into()),
                    customer_ref: None,
                    subscription_ref: None,
                    plan_name: None,
                    amount_cents: 9_700,
                    currency: "USD".into(),
                },
            )
            .await;
        let engine = DunningEngine::new(
            store,
            Arc::new(RecordingGateway::default()),
            Arc::new(RecordingNotifier::default()),
            &BillingConfig::with_secret("whsec_test"),
        );
        (engine, customer)
    }

    fn card(exp_month: u8, exp_year: i32) -> CampaignTrigger {
        CampaignTrigger::CardExpiring {
            exp_month,
            exp_year,
            last4: Some("0005".into()),
        }
    }

    // =========================================================================
    // Card reported less than 30 days out: first notice goes out now
    // =========================================================================
    #[tokio::test]
    async fn test_late_card_notice_is_due_immediately() {
        let (engine, customer) = engine().await;
        let campaign = engine
            .start_campaign(customer, None, card(6, 2026), NOW)
            .await
            .unwrap()
            .into_campaign();
        assert_eq!(campaign.anchor_at, datetime!(2026-07-01 00:00 UTC));
        assert_eq!(campaign.next_action_at, NOW);
    }

    // =========================================================================
    // December expiry rolls the anchor into January of the next year
    // =========================================================================
    #[tokio::test]
    async fn test_december_expiry_anchor() {
        let (engine, customer) = engine().await;
        let campaign = engine
            .start_campaign(customer, None, card(12, 2026), NOW)
            .await
            .unwrap()
            .into_campaign();
        assert_eq!(campaign.anchor_at, datetime!(2027-01-01 00:00 UTC));
        assert_eq!(campaign.template, TemplateId::ExpiringCards);
    }

    #[tokio::test]
    async fn test_invalid_expiry_month_rejected() {
        let (engine, customer) = engine().await;
        for month in [0, 13] {
            let err = engine
                .start_campaign(customer, None, card(month, 2026), NOW)
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::InvalidInput(_)), "month {month}");
        }
    }

    // =========================================================================
    // A sweep that runs days late executes one step, then catches up
    // on the following sweeps instead of replaying the backlog at once
    // =========================================================================
    #[tokio::test]
    async fn test_overdue_campaign_runs_one_step_per_sweep() {
        let (engine, customer) = engine().await;
        let trigger = CampaignTrigger::FailedPayment {
            invoice_id: "in_1".into(),
            amount_cents: 9_700,
            attempt_count: 1,
            failure_code: None,
            failure_message: None,
        };
        let campaign = engine
            .start_campaign(customer, Some(Uuid::new_v4()), trigger, NOW)
            .await
            .unwrap()
            .into_campaign();

        let late = NOW + Duration::days(10);
        let report = engine.process_due(late).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.advanced, 1);

        let current = engine.get_campaign(campaign.id).await.unwrap();
        assert_eq!(current.current_step, 2);
        assert_eq!(current.next_action_at, late);

        engine.process_due(late).await.unwrap();
        let current = engine.get_campaign(campaign.id).await.unwrap();
        assert_eq!(current.current_step, 3);
    }

    #[test]
    fn test_dedupe_keys() {
        let customer = Uuid::new_v4();
        let sub = Uuid::new_v4();
        assert_eq!(
            dedupe_key(CampaignKind::FailedPayment, customer, Some(sub)),
            format!("subscription:{sub}")
        );
        assert_eq!(
            dedupe_key(CampaignKind::CardExpiring, customer, Some(sub)),
            format!("customer:{customer}:card_expiring")
        );
        assert_ne!(
            dedupe_key(CampaignKind::FailedPayment, customer, None),
            dedupe_key(CampaignKind::CardExpiring, customer, None)
        );
    }
}

#[cfg(test)]
mod scoring_tests {
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};

    use crate::dunning::scoring::{select_template, success_probability};
    use crate::dunning::{CampaignKind, CustomerProfile, TemplateId};

    const NOW: OffsetDateTime = datetime!(2026-06-01 12:00 UTC);

    // =========================================================================
    // Every bonus together would reach 1.20; the result is capped at 0.95
    // =========================================================================
    #[test]
    fn test_probability_is_capped() {
        let profile = CustomerProfile {
            customer_since: Some(NOW - Duration::days(800)),
            lifetime_value_cents: 2_000_000,
            monthly_value_cents: 500_000,
            churn_risk_score: Some(0.1),
            successful_payments: 40,
            failed_payments: 0,
            past_recovery_rate: Some(0.9),
        };
        assert_eq!(success_probability(&profile, NOW), 0.95);
    }

    // =========================================================================
    // Thresholds are strict: exactly 365 days / $5,000 earns no bonus
    // =========================================================================
    #[test]
    fn test_thresholds_are_exclusive() {
        let profile = CustomerProfile {
            customer_since: Some(NOW - Duration::days(365)),
            lifetime_value_cents: 500_000,
            churn_risk_score: Some(0.3),
            successful_payments: 10,
            failed_payments: 0,
            past_recovery_rate: Some(0.5),
            ..Default::default()
        };
        assert_eq!(success_probability(&profile, NOW), 0.65);
    }

    // =========================================================================
    // High value wins over the card-expiry template
    // =========================================================================
    #[test]
    fn test_high_value_boundaries() {
        let at_monthly = CustomerProfile {
            monthly_value_cents: 300_000,
            ..Default::default()
        };
        assert_eq!(
            select_template(&at_monthly, CampaignKind::CardExpiring),
            TemplateId::HighValueCustomer
        );

        let below = CustomerProfile {
            monthly_value_cents: 299_999,
            lifetime_value_cents: 999_999,
            ..Default::default()
        };
        assert_eq!(
            select_template(&below, CampaignKind::FailedPayment),
            TemplateId::FailedPaymentStandard
        );
        assert_eq!(
            select_template(&below, CampaignKind::CardExpiring),
            TemplateId::ExpiringCards
        );
    }
}

#[cfg(test)]
mod webhook_tests {
    use std::time::Duration;

    use time::macros::datetime;
    use time::OffsetDateTime;

    use crate::webhooks::{sign, verify_signature, EventKind, WebhookEvent};

    const NOW: OffsetDateTime = datetime!(2026-06-01 12:00 UTC);

    // =========================================================================
    // Zero tolerance accepts only the exact second
    // =========================================================================
    #[test]
    fn test_zero_tolerance() {
        let body = "{}";
        let exact = sign(body, "whsec_k", NOW.unix_timestamp()).unwrap();
        assert!(verify_signature(body, &exact, "whsec_k", Duration::ZERO, NOW).is_ok());

        let one_off = sign(body, "whsec_k", NOW.unix_timestamp() - 1).unwrap();
        assert!(verify_signature(body, &one_off, "whsec_k", Duration::ZERO, NOW).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = r#"{"id":"evt_1"}"#;
        let header = sign(body, "whsec_a", NOW.unix_timestamp()).unwrap();
        assert!(verify_signature(body, &header, "whsec_b", Duration::from_secs(300), NOW).is_err());
    }

    // =========================================================================
    // Unknown fields and event types parse; routing ignores the type
    // =========================================================================
    #[test]
    fn test_unknown_event_type_parses_but_is_not_routed() {
        let event = WebhookEvent::parse(
            r#"{"id":"evt_2","type":"charge.dispute.created","created":1780000000,
                "livemode":false,"data":{"object":{"id":"dp_1"}}}"#,
        )
        .unwrap();
        assert_eq!(EventKind::from_type(&event.event_type), None);
        assert_eq!(event.created_at().unix_timestamp(), 1_780_000_000);
    }
}

#[cfg(test)]
mod discount_tests {
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};

    use crate::subscriptions::{Discount, DiscountType};

    const NOW: OffsetDateTime = datetime!(2026-06-01 12:00 UTC);

    fn discount(discount_type: DiscountType, value: i64) -> Discount {
        Discount {
            code: "SPRING".into(),
            discount_type,
            value_bps_or_cents: value,
            applicable_plans: None,
            is_active: true,
            valid_until: None,
            max_redemptions: None,
            redemptions_count: 0,
        }
    }

    #[test]
    fn test_fixed_discount_never_goes_negative() {
        assert_eq!(discount(DiscountType::FixedAmount, 20_000).apply(9_700), 0);
    }

    #[test]
    fn test_percentage_over_100_is_clamped() {
        assert_eq!(discount(DiscountType::Percentage, 15_000).apply(9_700), 0);
        assert_eq!(discount(DiscountType::Percentage, -500).apply(9_700), 9_700);
    }

    // =========================================================================
    // The redemption cap is reached at count == max
    // =========================================================================
    #[test]
    fn test_redemption_cap_boundary() {
        let mut d = discount(DiscountType::Percentage, 1_000);
        d.max_redemptions = Some(5);
        d.redemptions_count = 4;
        assert_eq!(d.rejection("elite_coaching", NOW), None);
        d.redemptions_count = 5;
        assert_eq!(d.rejection("elite_coaching", NOW), Some("fully redeemed"));
    }

    #[test]
    fn test_expiry_boundary() {
        let mut d = discount(DiscountType::Percentage, 1_000);
        d.valid_until = Some(NOW);
        assert_eq!(d.rejection("elite_coaching", NOW), None);
        d.valid_until = Some(NOW - Duration::seconds(1));
        assert_eq!(d.rejection("elite_coaching", NOW), Some("expired"));
    }
}
