//! Campaign lifecycle: start, execute, sweep, resolve

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use super::analytics::{self, RecoveryAnalytics};
use super::campaign::{
    dedupe_key, Campaign, CampaignInsert, CampaignKind, CampaignOutcome, CampaignStatus,
    CampaignTrigger, DunningActionRecord, DunningStep, NewCampaign, StepAction,
};
use super::scoring::{select_template, success_probability, CustomerProfile};
use super::store::{CampaignContext, CampaignStore, NewAction};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::providers::{render, MessageContext, Notifier, PaymentGateway, PaymentRetryRequest};

/// What happened when a step ran
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepOutcome {
    Recovered { amount_cents: i64 },
    Advanced { next_step: i32, next_action_at: OffsetDateTime },
    Exhausted,
    /// Another worker moved the campaign first
    Superseded,
}

/// Counts from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub advanced: usize,
    pub recovered: usize,
    pub exhausted: usize,
    pub superseded: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignDetail {
    pub campaign: Campaign,
    pub actions: Vec<DunningActionRecord>,
}

#[derive(Debug)]
struct ActionResult {
    success: bool,
    detail: serde_json::Value,
    recovered_cents: Option<i64>,
}

impl ActionResult {
    fn ok(detail: serde_json::Value) -> Self {
        Self {
            success: true,
            detail,
            recovered_cents: None,
        }
    }
}

pub struct DunningEngine {
    store: Arc<dyn CampaignStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    batch_size: i64,
    lease: time::Duration,
    portal_url: String,
}

impl DunningEngine {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        config: &BillingConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            batch_size: config.dunning_batch_size.max(1),
            lease: time::Duration::seconds(config.dunning_lease.as_secs() as i64),
            portal_url: config.billing_portal_url.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CampaignStore> {
        &self.store
    }

    /// Open a campaign for the customer unless one is already running for the
    /// same subscription (or, for card expiry, the same customer)
    pub async fn start_campaign(
        &self,
        customer_id: Uuid,
        subscription_id: Option<Uuid>,
        trigger: CampaignTrigger,
        now: OffsetDateTime,
    ) -> BillingResult<CampaignInsert> {
        let kind = trigger.kind();
        let anchor = trigger.anchor(now)?;

        let profile = match self.store.customer_profile(customer_id, subscription_id).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "Customer profile unavailable, using default scoring"
                );
                CustomerProfile::default()
            }
        };
        let template = select_template(&profile, kind);
        let probability = success_probability(&profile, now);

        let first_step = template.template().step(1).ok_or_else(|| {
            BillingError::Internal(format!("template {template} has no steps"))
        })?;

        let insert = self
            .store
            .insert_campaign(NewCampaign {
                customer_id,
                subscription_id,
                dedupe_key: dedupe_key(kind, customer_id, subscription_id),
                template,
                anchor_at: anchor,
                next_action_at: first_step.due_at(anchor, now),
                success_probability: probability,
                trigger,
                started_at: now,
            })
            .await?;

        match &insert {
            CampaignInsert::Created(c) => tracing::info!(
                campaign_id = %c.id,
                customer_id = %customer_id,
                template = %c.template,
                success_probability = c.success_probability,
                next_action_at = %c.next_action_at,
                "Dunning campaign started"
            ),
            CampaignInsert::AlreadyOpen(c) => tracing::info!(
                campaign_id = %c.id,
                customer_id = %customer_id,
                "Dunning campaign already open, not starting another"
            ),
        }

        Ok(insert)
    }

    /// Run the campaign's current step and move it forward
    pub async fn execute_step(
        &self,
        campaign: &Campaign,
        now: OffsetDateTime,
    ) -> BillingResult<StepOutcome> {
        if campaign.status != CampaignStatus::Active {
            return Err(BillingError::InvalidCampaignState {
                campaign_id: campaign.id,
                status: campaign.status.to_string(),
                expected: CampaignStatus::Active.to_string(),
            });
        }
        let template = campaign.template.template();
        let step = template.step(campaign.current_step).ok_or_else(|| {
            BillingError::InvalidCampaignState {
                campaign_id: campaign.id,
                status: format!("at step {}", campaign.current_step),
                expected: format!("step within 1..={}", template.total_steps()),
            }
        })?;

        // The snapshot may predate a payment or another worker's advance
        match self.store.get_campaign(campaign.id).await? {
            Some(current)
                if current.status == CampaignStatus::Active
                    && current.current_step == campaign.current_step => {}
            _ => return Ok(StepOutcome::Superseded),
        }

        let context = self.store.campaign_context(campaign).await?;
        let result = match self.run_action(campaign, step, &context, now).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    campaign_id = %campaign.id,
                    step = step.number,
                    action = %step.action.action_type(),
                    error = %e,
                    "Dunning action failed, continuing sequence"
                );
                ActionResult {
                    success: false,
                    detail: json!({ "error": e.to_string() }),
                    recovered_cents: None,
                }
            }
        };

        let recorded = self
            .store
            .record_action(NewAction {
                campaign_id: campaign.id,
                step_number: step.number,
                action_type: step.action.action_type(),
                success: result.success,
                detail: result.detail,
                executed_at: now,
            })
            .await?;
        if !recorded {
            tracing::debug!(
                campaign_id = %campaign.id,
                step = step.number,
                "Step already recorded by an earlier attempt"
            );
        }

        if let Some(amount_cents) = result.recovered_cents {
            let outcome = CampaignOutcome::Recovered { amount_cents };
            if !self.store.complete(campaign.id, &outcome, now).await? {
                return Ok(StepOutcome::Superseded);
            }
            tracing::info!(
                campaign_id = %campaign.id,
                step = step.number,
                amount_cents,
                "Payment recovered, campaign completed"
            );
            return Ok(StepOutcome::Recovered { amount_cents });
        }

        match template.step(step.number + 1) {
            Some(next) => {
                let next_action_at = next.due_at(campaign.anchor_at, now);
                let advanced = self
                    .store
                    .advance(campaign.id, step.number, next.number, next_action_at)
                    .await?;
                if !advanced {
                    tracing::info!(
                        campaign_id = %campaign.id,
                        expected_step = step.number,
                        "Campaign moved by another worker, skipping advance"
                    );
                    return Ok(StepOutcome::Superseded);
                }
                tracing::debug!(
                    campaign_id = %campaign.id,
                    next_step = next.number,
                    next_action_at = %next_action_at,
                    "Campaign advanced"
                );
                Ok(StepOutcome::Advanced {
                    next_step: next.number,
                    next_action_at,
                })
            }
            None => {
                if !self
                    .store
                    .complete(campaign.id, &CampaignOutcome::Exhausted, now)
                    .await?
                {
                    return Ok(StepOutcome::Superseded);
                }
                tracing::info!(
                    campaign_id = %campaign.id,
                    "Dunning campaign exhausted without recovery"
                );
                Ok(StepOutcome::Exhausted)
            }
        }
    }

    /// Claim and execute every campaign whose next action is due
    pub async fn process_due(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let claimed = self
            .store
            .claim_due(now, self.lease, self.batch_size)
            .await?;

        let mut report = SweepReport {
            claimed: claimed.len(),
            ..Default::default()
        };

        for campaign in &claimed {
            match self.execute_step(campaign, now).await {
                Ok(StepOutcome::Advanced { .. }) => report.advanced += 1,
                Ok(StepOutcome::Recovered { .. }) => report.recovered += 1,
                Ok(StepOutcome::Exhausted) => report.exhausted += 1,
                Ok(StepOutcome::Superseded) => report.superseded += 1,
                Err(e) if e.is_transient() => {
                    // Lease expiry hands the campaign to a later sweep
                    report.errors += 1;
                    tracing::error!(
                        campaign_id = %campaign.id,
                        error = %e,
                        "Dunning step failed, will retry after lease expires"
                    );
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        campaign_id = %campaign.id,
                        error = %e,
                        "Dunning step cannot run, failing campaign"
                    );
                    let outcome = CampaignOutcome::Failed {
                        reason: e.to_string(),
                    };
                    if let Err(close_err) = self.store.complete(campaign.id, &outcome, now).await {
                        tracing::error!(
                            campaign_id = %campaign.id,
                            error = %close_err,
                            "Failed to mark campaign failed"
                        );
                    }
                }
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                claimed = report.claimed,
                advanced = report.advanced,
                recovered = report.recovered,
                exhausted = report.exhausted,
                superseded = report.superseded,
                errors = report.errors,
                "Dunning sweep finished"
            );
        }

        Ok(report)
    }

    /// Close the open failed-payment campaign for an invoice that has been paid.
    ///
    /// A campaign keyed on the subscription is closed outright. A campaign
    /// keyed on the customer, started for an invoice without a subscription,
    /// is closed only when it was started for this invoice.
    ///
    /// Returns the id of the campaign that was closed, if any.
    pub async fn resolve_payment(
        &self,
        customer_id: Uuid,
        subscription_id: Option<Uuid>,
        invoice_ref: &str,
        amount_cents: i64,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Uuid>> {
        let outcome = CampaignOutcome::Recovered { amount_cents };

        if let Some(subscription_id) = subscription_id {
            if let Some(campaign) = self
                .store
                .open_campaign_for_subscription(subscription_id)
                .await?
            {
                return self.close(&campaign, outcome, now).await;
            }
        }

        let key = dedupe_key(CampaignKind::FailedPayment, customer_id, None);
        match self.store.open_campaign_by_key(&key).await? {
            Some(campaign) if campaign.trigger.invoice_id() == Some(invoice_ref) => {
                self.close(&campaign, outcome, now).await
            }
            _ => Ok(None),
        }
    }

    pub async fn cancel_for_subscription(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Uuid>> {
        match self
            .store
            .open_campaign_for_subscription(subscription_id)
            .await?
        {
            Some(campaign) => self.close(&campaign, CampaignOutcome::Canceled, now).await,
            None => Ok(None),
        }
    }

    async fn close(
        &self,
        campaign: &Campaign,
        outcome: CampaignOutcome,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Uuid>> {
        if !self.store.complete(campaign.id, &outcome, now).await? {
            return Ok(None);
        }
        tracing::info!(
            campaign_id = %campaign.id,
            customer_id = %campaign.customer_id,
            subscription_id = ?campaign.subscription_id,
            outcome = ?outcome,
            "Dunning campaign closed"
        );
        Ok(Some(campaign.id))
    }

    pub async fn pause(&self, id: Uuid) -> BillingResult<Campaign> {
        let campaign = self.get_campaign(id).await?;
        if !self
            .store
            .set_status(id, CampaignStatus::Active, CampaignStatus::Paused, None)
            .await?
        {
            return Err(BillingError::InvalidCampaignState {
                campaign_id: id,
                status: campaign.status.to_string(),
                expected: CampaignStatus::Active.to_string(),
            });
        }
        tracing::info!(campaign_id = %id, "Dunning campaign paused");
        self.get_campaign(id).await
    }

    /// Resume a paused campaign; a step that fell due while paused runs on
    /// the next sweep
    pub async fn resume(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<Campaign> {
        let campaign = self.get_campaign(id).await?;
        let next_action_at = campaign.next_action_at.max(now);
        if !self
            .store
            .set_status(
                id,
                CampaignStatus::Paused,
                CampaignStatus::Active,
                Some(next_action_at),
            )
            .await?
        {
            return Err(BillingError::InvalidCampaignState {
                campaign_id: id,
                status: campaign.status.to_string(),
                expected: CampaignStatus::Paused.to_string(),
            });
        }
        tracing::info!(campaign_id = %id, next_action_at = %next_action_at, "Dunning campaign resumed");
        self.get_campaign(id).await
    }

    pub async fn get_campaign(&self, id: Uuid) -> BillingResult<Campaign> {
        self.store
            .get_campaign(id)
            .await?
            .ok_or(BillingError::CampaignNotFound(id))
    }

    pub async fn campaign_detail(&self, id: Uuid) -> BillingResult<CampaignDetail> {
        let campaign = self.get_campaign(id).await?;
        let mut actions = self.store.actions_for_campaigns(&[id]).await?;
        actions.sort_by_key(|a| a.step_number);
        Ok(CampaignDetail { campaign, actions })
    }

    /// Recovery performance for campaigns started in the last `days` days
    pub async fn recovery_analytics(
        &self,
        days: i64,
        now: OffsetDateTime,
    ) -> BillingResult<RecoveryAnalytics> {
        if days <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "days must be positive, got {days}"
            )));
        }
        let start = now - time::Duration::days(days);
        let campaigns = self.store.campaigns_started_between(start, now).await?;
        let ids: Vec<Uuid> = campaigns.iter().map(|c| c.id).collect();
        let actions = self.store.actions_for_campaigns(&ids).await?;
        Ok(analytics::summarize(days, &campaigns, &actions))
    }

    async fn run_action(
        &self,
        campaign: &Campaign,
        step: &DunningStep,
        context: &CampaignContext,
        now: OffsetDateTime,
    ) -> BillingResult<ActionResult> {
        let mut message = self.message_context(campaign, context);

        match &step.action {
            StepAction::Email {
                template,
                discount_percent,
            } => {
                if let (Some(percent), Some(sub_ref)) = (discount_percent, &context.subscription_ref)
                {
                    self.gateway.apply_discount(sub_ref, *percent, 1).await?;
                }
                message.discount_percent = *discount_percent;
                self.email(context, template, &message).await
            }
            StepAction::Sms { template } => {
                let phone = require_phone(context)?;
                let rendered = render(template, &message);
                let receipt = self.notifier.send_sms(phone, &rendered.body).await?;
                Ok(ActionResult::ok(json!({
                    "template": template,
                    "recipient": phone,
                    "delivered": receipt.delivered,
                    "reference": receipt.reference,
                })))
            }
            StepAction::PhoneCall { purpose } => {
                let phone = require_phone(context)?;
                let receipt = self
                    .notifier
                    .request_call(phone, &context.full_name(), purpose)
                    .await?;
                Ok(ActionResult::ok(json!({
                    "purpose": purpose,
                    "recipient": phone,
                    "delivered": receipt.delivered,
                    "reference": receipt.reference,
                })))
            }
            StepAction::PaymentRetry { strategy } => {
                let invoice_ref = match &campaign.trigger {
                    CampaignTrigger::FailedPayment { invoice_id, .. } => Some(invoice_id.clone()),
                    CampaignTrigger::CardExpiring { .. } => None,
                };
                let attempt = self
                    .gateway
                    .retry_payment(&PaymentRetryRequest {
                        idempotency_key: format!("{}:{}", campaign.id, step.number),
                        customer_ref: context.customer_ref.clone(),
                        subscription_ref: context.subscription_ref.clone(),
                        invoice_ref,
                        amount_cents: context.amount_cents,
                        currency: context.currency.clone(),
                        strategy: *strategy,
                    })
                    .await?;
                let recovered_cents = attempt.recovered_cents();
                Ok(ActionResult {
                    success: recovered_cents.is_some(),
                    detail: json!({ "strategy": strategy, "attempt": attempt }),
                    recovered_cents,
                })
            }
            StepAction::DiscountOffer { percent, months } => {
                let sub_ref = context.subscription_ref.as_deref().ok_or_else(|| {
                    BillingError::InvalidInput("no subscription to discount".to_string())
                })?;
                self.gateway.apply_discount(sub_ref, *percent, *months).await?;
                message.discount_percent = Some(*percent);
                message.discount_months = Some(*months);
                self.email(context, "discount_offer", &message).await
            }
            StepAction::PaymentPlan { max_installments } => {
                message.max_installments = Some(*max_installments);
                self.email(context, "payment_plan_offer", &message).await
            }
            StepAction::CancelSubscription { winback_after_days } => {
                if let Some(sub_ref) = &context.subscription_ref {
                    self.gateway.cancel_subscription(sub_ref).await?;
                }
                if let Some(subscription_id) = campaign.subscription_id {
                    self.store
                        .mark_subscription_canceled(subscription_id, now)
                        .await?;
                }
                tracing::info!(
                    campaign_id = %campaign.id,
                    subscription_id = ?campaign.subscription_id,
                    "Subscription canceled by dunning"
                );
                // The cancellation stands even if the notice cannot be sent
                let notice = self.email(context, "subscription_canceled", &message).await;
                let notified = notice.as_ref().map(|r| r.success).unwrap_or(false);
                Ok(ActionResult::ok(json!({
                    "canceled": true,
                    "winback_after_days": winback_after_days,
                    "notified": notified,
                })))
            }
        }
    }

    async fn email(
        &self,
        context: &CampaignContext,
        template: &str,
        message: &MessageContext,
    ) -> BillingResult<ActionResult> {
        if context.email.trim().is_empty() {
            return Err(BillingError::InvalidInput("customer has no email".to_string()));
        }
        let rendered = render(template, message);
        let receipt = self.notifier.send_email(&context.email, &rendered).await?;
        Ok(ActionResult::ok(json!({
            "template": template,
            "recipient": context.email,
            "delivered": receipt.delivered,
            "reference": receipt.reference,
        })))
    }

    fn message_context(&self, campaign: &Campaign, context: &CampaignContext) -> MessageContext {
        let card_last4 = match &campaign.trigger {
            CampaignTrigger::CardExpiring { last4, .. } => last4.clone(),
            CampaignTrigger::FailedPayment { .. } => None,
        };
        MessageContext {
            first_name: context.first_name.clone(),
            plan_name: context.plan_name.clone(),
            amount_cents: context.amount_cents,
            currency: context.currency.clone(),
            portal_url: self.portal_url.clone(),
            card_last4,
            ..Default::default()
        }
    }
}

fn require_phone(context: &CampaignContext) -> BillingResult<&str> {
    context
        .phone
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| BillingError::InvalidInput("no phone number available".to_string()))
}
