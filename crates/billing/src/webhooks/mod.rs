//! Payment processor webhook handling
//!
//! Every delivery is claimed atomically on its event id before any side
//! effect runs, so concurrent or repeated deliveries of the same event are
//! processed once. The raw event is stored with the claim and can be
//! replayed later if processing failed.

mod events;
mod signature;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::customer::{normalize_email, CustomerService};
use crate::dunning::{CampaignTrigger, DunningEngine};
use crate::error::{BillingError, BillingResult};
use crate::models::{InvoiceStatus, LifecycleStage, SubscriptionStatus};
use crate::plans::Plan;
use crate::providers::{render, MessageContext, Notifier};
use crate::subscriptions::{ExternalSubscription, SubscriptionService};

pub use events::{
    CustomerObject, EventData, ExpiringSourceObject, InvoiceObject, PriceObject,
    SubscriptionObject, WebhookEvent,
};
pub use signature::{sign, verify_signature};

/// Minutes after which a claim stuck in `processing` may be taken over
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Claims after which a failed event is left for manual replay
pub const MAX_AUTOMATIC_ATTEMPTS: i32 = 5;

/// Event types this service acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CustomerCreated,
    CustomerUpdated,
    CustomerDeleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    TrialWillEnd,
    InvoiceCreated,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    SourceExpiring,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Option<Self> {
        Some(match event_type {
            "customer.created" => EventKind::CustomerCreated,
            "customer.updated" => EventKind::CustomerUpdated,
            "customer.deleted" => EventKind::CustomerDeleted,
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "customer.subscription.trial_will_end" => EventKind::TrialWillEnd,
            "invoice.created" | "invoice.finalized" => EventKind::InvoiceCreated,
            "invoice.payment_succeeded" | "invoice.paid" => EventKind::InvoicePaymentSucceeded,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            "customer.source.expiring" => EventKind::SourceExpiring,
            _ => return None,
        })
    }
}

/// What `handle_event` did with a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    /// Acknowledged but not acted on
    Ignored,
    /// Already handled, or being handled by another request
    Duplicate,
}

#[derive(Debug, Default)]
pub struct WebhookStats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    duplicate: AtomicU64,
    ignored: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WebhookStatsSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub duplicate: u64,
    pub ignored: u64,
}

impl WebhookStats {
    pub fn record(&self, result: &BillingResult<WebhookOutcome>) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            Ok(WebhookOutcome::Processed) => &self.successful,
            Ok(WebhookOutcome::Ignored) => &self.ignored,
            Ok(WebhookOutcome::Duplicate) => &self.duplicate,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WebhookStatsSnapshot {
        WebhookStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
        }
    }
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: OffsetDateTime,
}

/// Result of a webhook replay operation
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}

pub struct WebhookHandler {
    pool: PgPool,
    config: BillingConfig,
    customers: CustomerService,
    subscriptions: SubscriptionService,
    engine: Arc<DunningEngine>,
    notifier: Arc<dyn Notifier>,
    stats: WebhookStats,
}

impl WebhookHandler {
    pub fn new(
        pool: PgPool,
        config: BillingConfig,
        engine: Arc<DunningEngine>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            customers: CustomerService::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            pool,
            config,
            engine,
            notifier,
            stats: WebhookStats::default(),
        }
    }

    pub fn stats(&self) -> WebhookStatsSnapshot {
        self.stats.snapshot()
    }

    /// Verify the signature header and parse the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        verify_signature(
            payload,
            signature,
            &self.config.webhook_secret,
            self.config.webhook_tolerance,
            OffsetDateTime::now_utc(),
        )?;
        WebhookEvent::parse(payload)
    }

    /// Handle a verified event exactly once
    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let result = self.claim_and_process(event).await;
        self.stats.record(&result);
        result
    }

    async fn claim_and_process(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let payload = serde_json::to_value(event)?;

        // A fresh event inserts. A redelivery only wins the claim if the
        // earlier attempt errored or has been stuck in processing too long.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (event_id, event_type, event_timestamp, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                retry_count = webhook_events.retry_count + 1,
                payload = EXCLUDED.payload
            WHERE webhook_events.processing_result = 'error'
               OR (webhook_events.processing_result = 'processing'
                   AND webhook_events.processing_started_at < NOW() - make_interval(mins => $5))
            RETURNING id
            "#,
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(event.created_at())
        .bind(&payload)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event, already processed or in progress"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = self.process_event(event).await;
        let (processing_result, error_message) = match &result {
            Ok(WebhookOutcome::Ignored) => ("ignored", None),
            Ok(_) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        let malformed = matches!(&result, Err(e) if e.is_malformed_payload());
        self.finish(&event.id, processing_result, error_message.as_deref(), malformed)
            .await;

        if let Err(e) = &result {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook processing failed"
            );
        }
        result
    }

    /// Record the outcome of a claim. A malformed payload will fail the same way
    /// on every attempt, so it is also taken out of the automatic replay sweep.
    async fn finish(
        &self,
        event_id: &str,
        processing_result: &str,
        error_message: Option<&str>,
        malformed: bool,
    ) {
        for attempt in 1..=2 {
            let update = sqlx::query(
                r#"
                UPDATE webhook_events
                SET processing_result = $2,
                    error_message = $3,
                    retry_count = CASE WHEN $4 THEN GREATEST(retry_count, $5) ELSE retry_count END
                WHERE event_id = $1
                "#,
            )
            .bind(event_id)
            .bind(processing_result)
            .bind(error_message)
            .bind(malformed)
            .bind(MAX_AUTOMATIC_ATTEMPTS)
            .execute(&self.pool)
            .await;

            match update {
                Ok(_) => return,
                Err(e) if attempt == 1 => {
                    tracing::warn!(event_id = %event_id, error = %e, "Webhook result update failed, retrying");
                }
                Err(e) => {
                    // The claim times out after PROCESSING_TIMEOUT_MINUTES and can be re-taken
                    tracing::error!(
                        event_id = %event_id,
                        processing_result = %processing_result,
                        error = %e,
                        "Failed to record webhook result, event stays in processing"
                    );
                }
            }
        }
    }

    async fn process_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let Some(kind) = EventKind::from_type(&event.event_type) else {
            tracing::debug!(event_type = %event.event_type, "Unhandled webhook event type");
            return Ok(WebhookOutcome::Ignored);
        };

        match kind {
            EventKind::CustomerCreated => self.customer_created(&event.object()?).await?,
            EventKind::CustomerUpdated => self.customer_updated(&event.object()?).await?,
            EventKind::CustomerDeleted => self.customer_deleted(&event.object()?).await?,
            EventKind::SubscriptionCreated => {
                self.subscription_changed(&event.object()?, true).await?
            }
            EventKind::SubscriptionUpdated => {
                self.subscription_changed(&event.object()?, false).await?
            }
            EventKind::SubscriptionDeleted => self.subscription_deleted(&event.object()?).await?,
            EventKind::TrialWillEnd => self.trial_will_end(&event.object()?).await?,
            EventKind::InvoiceCreated => {
                let invoice: InvoiceObject = event.object()?;
                let customer_id = self.customer_id(&invoice.customer).await?;
                let subscription_id = self.subscription_id(invoice.subscription.as_deref()).await?;
                let mut tx = self.pool.begin().await?;
                upsert_invoice(
                    &mut tx,
                    &invoice,
                    customer_id,
                    subscription_id,
                    invoice.status_or(InvoiceStatus::Draft),
                    None,
                )
                .await?;
                tx.commit().await?;
            }
            EventKind::InvoicePaymentSucceeded => self.payment_succeeded(&event.object()?).await?,
            EventKind::InvoicePaymentFailed => self.payment_failed(&event.object()?).await?,
            EventKind::SourceExpiring => self.source_expiring(&event.object()?).await?,
        }
        Ok(WebhookOutcome::Processed)
    }

    async fn customer_id(&self, external_id: &str) -> BillingResult<Uuid> {
        self.customers
            .find_by_external_id(external_id)
            .await?
            .map(|c| c.id)
            .ok_or_else(|| BillingError::CustomerNotFound(external_id.to_string()))
    }

    async fn subscription_id(&self, external_id: Option<&str>) -> BillingResult<Option<Uuid>> {
        match external_id {
            Some(id) => Ok(self.subscriptions.find_by_external_id(id).await?.map(|s| s.id)),
            None => Ok(None),
        }
    }

    async fn customer_created(&self, obj: &CustomerObject) -> BillingResult<()> {
        if self.customers.find_by_external_id(&obj.id).await?.is_some() {
            return Ok(());
        }
        let Some(email) = obj.email.as_deref() else {
            tracing::warn!(customer = %obj.id, "Processor customer has no email, not importing");
            return Ok(());
        };
        let email = normalize_email(email)?;
        let (first_name, last_name) = crate::models::split_name(obj.name.as_deref().unwrap_or(""));

        sqlx::query(
            r#"
            INSERT INTO customers
                (email, first_name, last_name, phone, external_customer_id, billing_address,
                 preferred_currency, lifecycle_stage)
            VALUES ($1, $2, $3, $4, $5, COALESCE($6, '{}'::jsonb), COALESCE($7, 'USD'), 'prospect')
            ON CONFLICT (email) DO UPDATE SET
                external_customer_id = EXCLUDED.external_customer_id,
                updated_at = NOW()
            WHERE customers.external_customer_id IS NULL
            "#,
        )
        .bind(&email)
        .bind(&first_name)
        .bind(&last_name)
        .bind(&obj.phone)
        .bind(&obj.id)
        .bind(&obj.address)
        .bind(obj.currency.as_deref().map(str::to_uppercase))
        .execute(&self.pool)
        .await?;

        tracing::info!(customer = %obj.id, "Customer imported from processor");
        Ok(())
    }

    async fn customer_updated(&self, obj: &CustomerObject) -> BillingResult<()> {
        let email = obj.email.as_deref().map(normalize_email).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE customers SET
                email = COALESCE($2, email),
                phone = COALESCE($3, phone),
                billing_address = COALESCE($4, billing_address),
                preferred_currency = COALESCE($5, preferred_currency),
                updated_at = NOW()
            WHERE external_customer_id = $1
            "#,
        )
        .bind(&obj.id)
        .bind(&email)
        .bind(&obj.phone)
        .bind(&obj.address)
        .bind(obj.currency.as_deref().map(str::to_uppercase))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.customer_created(obj).await;
        }
        Ok(())
    }

    async fn customer_deleted(&self, obj: &CustomerObject) -> BillingResult<()> {
        if let Some(customer) = self.customers.find_by_external_id(&obj.id).await? {
            self.customers
                .set_lifecycle_stage(customer.id, LifecycleStage::Deleted)
                .await?;
        }
        Ok(())
    }

    fn external_subscription(
        obj: &SubscriptionObject,
        customer_id: Uuid,
    ) -> BillingResult<ExternalSubscription> {
        let item = obj.first_item()?;
        let plan_id = obj.plan_id()?;
        let catalog = Plan::find(&plan_id);
        Ok(ExternalSubscription {
            external_id: obj.id.clone(),
            customer_id,
            status: obj.status()?,
            interval: catalog.map_or_else(|| item.price.interval(), |p| p.interval),
            unit_amount_cents: item
                .price
                .unit_amount
                .or(catalog.map(|p| p.price_cents))
                .unwrap_or(0),
            currency: item
                .price
                .currency
                .as_deref()
                .map(str::to_uppercase)
                .unwrap_or_else(|| "USD".to_string()),
            quantity: item.quantity.unwrap_or(1),
            plan_id,
            current_period_start: obj.period_start(),
            current_period_end: obj.period_end(),
            trial_start: obj.trial_start_at(),
            trial_end: obj.trial_end_at(),
            cancel_at: obj.cancel_at_time(),
            canceled_at: obj.canceled_at_time(),
            ended_at: obj.ended_at_time(),
        })
    }

    async fn subscription_changed(&self, obj: &SubscriptionObject, created: bool) -> BillingResult<()> {
        let customer_id = self.customer_id(&obj.customer).await?;
        let external = Self::external_subscription(obj, customer_id)?;
        let subscription = self.subscriptions.upsert_external(&external).await?;

        let stage = match subscription.status {
            SubscriptionStatus::Trialing => Some(LifecycleStage::Trial),
            SubscriptionStatus::Active if created => Some(LifecycleStage::Active),
            SubscriptionStatus::PastDue => Some(LifecycleStage::PastDue),
            s if s.is_churned() => Some(LifecycleStage::Churned),
            _ => None,
        };
        if let Some(stage) = stage {
            self.customers.set_lifecycle_stage(customer_id, stage).await?;
        }

        if subscription.status == SubscriptionStatus::Canceled {
            self.engine
                .cancel_for_subscription(subscription.id, OffsetDateTime::now_utc())
                .await?;
        }

        tracing::info!(
            subscription = %obj.id,
            subscription_id = %subscription.id,
            status = %subscription.status,
            "Subscription synced from processor"
        );
        Ok(())
    }

    async fn subscription_deleted(&self, obj: &SubscriptionObject) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        let customer_id = self.customer_id(&obj.customer).await?;
        let mut external = Self::external_subscription(obj, customer_id)?;
        external.status = SubscriptionStatus::Canceled;
        external.canceled_at = external.canceled_at.or(Some(now));
        external.ended_at = external.ended_at.or(Some(now));

        let subscription = self.subscriptions.upsert_external(&external).await?;
        self.customers
            .set_lifecycle_stage(customer_id, LifecycleStage::Churned)
            .await?;
        if let Some(campaign_id) = self
            .engine
            .cancel_for_subscription(subscription.id, now)
            .await?
        {
            tracing::info!(
                subscription_id = %subscription.id,
                campaign_id = %campaign_id,
                "Dunning campaign closed because subscription was deleted"
            );
        }
        Ok(())
    }

    async fn trial_will_end(&self, obj: &SubscriptionObject) -> BillingResult<()> {
        let Some(customer) = self.customers.find_by_external_id(&obj.customer).await? else {
            return Err(BillingError::CustomerNotFound(obj.customer.clone()));
        };
        let plan_id = obj.plan_id()?;
        let item = obj.first_item()?;
        let context = MessageContext {
            first_name: customer.first_name.clone(),
            plan_name: Some(Plan::find(&plan_id).map_or(plan_id.clone(), |p| p.name.to_string())),
            amount_cents: item.price.unit_amount.unwrap_or(0),
            currency: customer.preferred_currency.clone(),
            portal_url: self.config.billing_portal_url.clone(),
            trial_ends_on: obj.trial_end_at().map(|t| format!("on {}", t.date())),
            ..Default::default()
        };
        let message = render("trial_will_end", &context);

        // A missed reminder is not worth a redelivery
        if let Err(e) = self.notifier.send_email(&customer.email, &message).await {
            tracing::warn!(customer_id = %customer.id, error = %e, "Trial ending email failed");
        }
        Ok(())
    }

    async fn payment_succeeded(&self, invoice: &InvoiceObject) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        let customer_id = self.customer_id(&invoice.customer).await?;
        let subscription_id = self.subscription_id(invoice.subscription.as_deref()).await?;
        let amount = if invoice.amount_paid > 0 {
            invoice.amount_paid
        } else {
            invoice.amount_due
        };

        let mut tx = self.pool.begin().await?;
        let invoice_id =
            upsert_invoice(&mut tx, invoice, customer_id, subscription_id, InvoiceStatus::Paid, Some(now))
                .await?;

        // One succeeded row per invoice; a replay of this event inserts nothing
        let recorded = sqlx::query(
            r#"
            INSERT INTO payment_transactions
                (customer_id, invoice_id, external_payment_id, amount_cents, currency, status,
                 attempt_number)
            VALUES ($1, $2, $3, $4, $5, 'succeeded', 0)
            ON CONFLICT (invoice_id, status, attempt_number) DO NOTHING
            "#,
        )
        .bind(customer_id)
        .bind(invoice_id)
        .bind(invoice.payment_ref())
        .bind(amount)
        .bind(invoice.currency())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let ltv_increase = if recorded > 0 { amount } else { 0 };

        sqlx::query(
            r#"
            UPDATE customers SET
                total_lifetime_value_cents = total_lifetime_value_cents + $2,
                lifecycle_stage = CASE
                    WHEN lifecycle_stage IN ('prospect', 'trial', 'past_due') THEN 'active'
                    ELSE lifecycle_stage
                END,
                last_activity_at = $3,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(customer_id)
        .bind(ltv_increase)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if let Some(sub_id) = subscription_id {
            sqlx::query(
                "UPDATE subscriptions SET status = 'active', updated_at = $2 WHERE id = $1 AND status = 'past_due'",
            )
            .bind(sub_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(
            invoice = %invoice.id,
            customer_id = %customer_id,
            amount_cents = amount,
            first_delivery = recorded > 0,
            "Payment succeeded"
        );

        // Invoices without a subscription are dunned per customer and still
        // need closing
        if let Some(campaign_id) = self
            .engine
            .resolve_payment(customer_id, subscription_id, &invoice.id, amount, now)
            .await?
        {
            tracing::info!(
                campaign_id = %campaign_id,
                subscription_id = ?subscription_id,
                amount_cents = amount,
                "Payment recovered during dunning"
            );
        }
        Ok(())
    }

    async fn payment_failed(&self, invoice: &InvoiceObject) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        let customer_id = self.customer_id(&invoice.customer).await?;
        let subscription_id = self.subscription_id(invoice.subscription.as_deref()).await?;

        let mut tx = self.pool.begin().await?;
        let invoice_id =
            upsert_invoice(&mut tx, invoice, customer_id, subscription_id, InvoiceStatus::Open, None)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO payment_transactions
                (customer_id, invoice_id, external_payment_id, amount_cents, currency, status,
                 failure_code, attempt_number)
            VALUES ($1, $2, $3, $4, $5, 'failed', $6, $7)
            ON CONFLICT (invoice_id, status, attempt_number) DO NOTHING
            "#,
        )
        .bind(customer_id)
        .bind(invoice_id)
        .bind(invoice.payment_ref())
        .bind(invoice.amount_due)
        .bind(invoice.currency())
        .bind(invoice.failure_code())
        .bind(invoice.attempt_count)
        .execute(&mut *tx)
        .await?;

        if let Some(sub_id) = subscription_id {
            sqlx::query(
                "UPDATE subscriptions SET status = 'past_due', updated_at = $2 WHERE id = $1 AND status IN ('active', 'trialing')",
            )
            .bind(sub_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "UPDATE customers SET lifecycle_stage = 'past_due', updated_at = $2 WHERE id = $1 AND lifecycle_stage IN ('trial', 'active')",
        )
        .bind(customer_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::warn!(
            invoice = %invoice.id,
            customer_id = %customer_id,
            amount_cents = invoice.amount_due,
            attempt = invoice.attempt_count,
            failure_code = ?invoice.failure_code(),
            "Payment failed"
        );

        let trigger = CampaignTrigger::FailedPayment {
            invoice_id: invoice.id.clone(),
            amount_cents: invoice.amount_due,
            attempt_count: invoice.attempt_count,
            failure_code: invoice.failure_code(),
            failure_message: invoice.failure_message(),
        };
        self.engine
            .start_campaign(customer_id, subscription_id, trigger, now)
            .await?;
        Ok(())
    }

    async fn source_expiring(&self, source: &ExpiringSourceObject) -> BillingResult<()> {
        let Some(external_customer) = source.customer.as_deref() else {
            tracing::warn!(source = %source.id, "Expiring source has no customer");
            return Ok(());
        };
        let customer_id = self.customer_id(external_customer).await?;
        let trigger = CampaignTrigger::CardExpiring {
            exp_month: source.exp_month,
            exp_year: source.exp_year,
            last4: source.last4.clone(),
        };
        self.engine
            .start_campaign(customer_id, None, trigger, OffsetDateTime::now_utc())
            .await?;
        Ok(())
    }

    // ============ WEBHOOK REPLAY ============

    /// Events whose processing errored or never finished
    pub async fn list_failed(&self, limit: i64, offset: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let records = sqlx::query_as::<_, WebhookEventRecord>(
            r#"
            SELECT id, event_id, event_type, event_timestamp, processing_result,
                   processing_started_at, error_message, retry_count, created_at
            FROM webhook_events
            WHERE processing_result IN ('error', 'processing')
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Re-run a stored event from its saved payload
    pub async fn replay(&self, event_id: &str) -> BillingResult<WebhookReplayResult> {
        let existing: Option<(Uuid, String, Option<String>, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT id, processing_result, error_message, payload
            FROM webhook_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let (record_id, previous_status, previous_error, payload) = existing
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {event_id}")))?;
        let event: WebhookEvent = serde_json::from_value(payload)?;

        // Same conditional claim as a redelivery: never replay a running event
        let claimed = sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = 'processing',
                processing_started_at = NOW(),
                retry_count = retry_count + 1
            WHERE event_id = $1
              AND (processing_result = 'error'
                   OR (processing_result = 'processing'
                       AND processing_started_at < NOW() - make_interval(mins => $2)))
            "#,
        )
        .bind(event_id)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .execute(&self.pool)
        .await?;

        if claimed.rows_affected() == 0 {
            return Err(BillingError::InvalidInput(format!(
                "webhook event {event_id} is {previous_status} and cannot be replayed"
            )));
        }

        tracing::info!(event_id = %event_id, previous_status = %previous_status, "Replaying webhook event");

        let result = self.process_event(&event).await;
        let (new_status, new_error) = match &result {
            Ok(WebhookOutcome::Ignored) => ("ignored".to_string(), None),
            Ok(_) => ("success".to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };
        let malformed = matches!(&result, Err(e) if e.is_malformed_payload());
        self.finish(event_id, &new_status, new_error.as_deref(), malformed)
            .await;

        tracing::info!(
            event_id = %event_id,
            previous_status = %previous_status,
            new_status = %new_status,
            success = result.is_ok(),
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            record_id,
            event_id: event_id.to_string(),
            event_type: event.event_type,
            previous_status,
            previous_error,
            new_status,
            new_error,
            success: result.is_ok(),
        })
    }

    /// Replay failed events, oldest first.
    ///
    /// Events claimed `MAX_AUTOMATIC_ATTEMPTS` times are skipped; they stay in
    /// `list_failed` and can still be replayed one by one.
    pub async fn replay_all_failed(&self, limit: i64) -> BillingResult<Vec<WebhookReplayResult>> {
        let failed: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT event_id FROM webhook_events
            WHERE processing_result = 'error'
              AND retry_count < $2
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(MAX_AUTOMATIC_ATTEMPTS)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(failed.len());
        for (event_id,) in failed {
            match self.replay(&event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(event_id = %event_id, error = %e, "Failed to replay webhook");
                    results.push(WebhookReplayResult {
                        record_id: Uuid::nil(),
                        event_id,
                        event_type: "unknown".to_string(),
                        previous_status: "error".to_string(),
                        previous_error: None,
                        new_status: "error".to_string(),
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }
        Ok(results)
    }
}

async fn upsert_invoice(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    invoice: &InvoiceObject,
    customer_id: Uuid,
    subscription_id: Option<Uuid>,
    status: InvoiceStatus,
    paid_at: Option<OffsetDateTime>,
) -> BillingResult<Uuid> {
    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO invoices (
            customer_id, subscription_id, external_invoice_id, status, amount_due_cents,
            amount_paid_cents, currency, attempt_count, next_payment_attempt, paid_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (external_invoice_id) DO UPDATE SET
            status = EXCLUDED.status,
            amount_due_cents = EXCLUDED.amount_due_cents,
            amount_paid_cents = GREATEST(invoices.amount_paid_cents, EXCLUDED.amount_paid_cents),
            attempt_count = GREATEST(invoices.attempt_count, EXCLUDED.attempt_count),
            next_payment_attempt = EXCLUDED.next_payment_attempt,
            paid_at = COALESCE(invoices.paid_at, EXCLUDED.paid_at),
            updated_at = NOW()
        RETURNING id
        "#,
    )
    .bind(customer_id)
    .bind(subscription_id)
    .bind(&invoice.id)
    .bind(status.as_str())
    .bind(invoice.amount_due)
    .bind(invoice.amount_paid)
    .bind(invoice.currency())
    .bind(invoice.attempt_count)
    .bind(invoice.next_attempt_at())
    .bind(paid_at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_routing() {
        assert_eq!(
            EventKind::from_type("invoice.payment_failed"),
            Some(EventKind::InvoicePaymentFailed)
        );
        assert_eq!(
            EventKind::from_type("invoice.finalized"),
            Some(EventKind::InvoiceCreated)
        );
        assert_eq!(
            EventKind::from_type("customer.source.expiring"),
            Some(EventKind::SourceExpiring)
        );
        assert_eq!(EventKind::from_type("charge.refunded"), None);
    }

    #[test]
    fn stats_count_each_outcome() {
        let stats = WebhookStats::default();
        stats.record(&Ok(WebhookOutcome::Processed));
        stats.record(&Ok(WebhookOutcome::Duplicate));
        stats.record(&Ok(WebhookOutcome::Ignored));
        stats.record(&Err(BillingError::WebhookSignatureInvalid));
        let snap = stats.snapshot();
        assert_eq!(snap.total, 4);
        assert_eq!(snap.successful, 1);
        assert_eq!(snap.duplicate, 1);
        assert_eq!(snap.ignored, 1);
        assert_eq!(snap.failed, 1);
    }
}
