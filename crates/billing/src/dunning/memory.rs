//! In-process campaign store for tests and local development
//!
//! Mirrors the conditional-write semantics of the Postgres store: the
//! one-open-campaign rule, leased claims and compare-and-set advancement.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::campaign::{
    Campaign, CampaignInsert, CampaignOutcome, CampaignStatus, DunningActionRecord, NewCampaign,
};
use super::scoring::CustomerProfile;
use super::store::{CampaignContext, CampaignStore, NewAction};
use crate::error::{BillingError, BillingResult};

#[derive(Default)]
struct State {
    customers: HashMap<Uuid, (CustomerProfile, CampaignContext)>,
    subscriptions: HashMap<Uuid, i64>,
    campaigns: HashMap<Uuid, Campaign>,
    actions: Vec<DunningActionRecord>,
    canceled_subscriptions: HashSet<Uuid>,
}

#[derive(Default)]
pub struct InMemoryCampaignStore {
    state: Mutex<State>,
}

impl InMemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_customer(
        &self,
        customer_id: Uuid,
        profile: CustomerProfile,
        context: CampaignContext,
    ) {
        self.state
            .lock()
            .await
            .customers
            .insert(customer_id, (profile, context));
    }

    /// Register a subscription and its monthly value
    pub async fn add_subscription(&self, subscription_id: Uuid, monthly_value_cents: i64) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription_id, monthly_value_cents);
    }

    pub async fn is_subscription_canceled(&self, subscription_id: Uuid) -> bool {
        self.state
            .lock()
            .await
            .canceled_subscriptions
            .contains(&subscription_id)
    }

    pub async fn actions(&self, campaign_id: Uuid) -> Vec<DunningActionRecord> {
        let state = self.state.lock().await;
        let mut actions: Vec<_> = state
            .actions
            .iter()
            .filter(|a| a.campaign_id == campaign_id)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.step_number);
        actions
    }

    /// Rewrite a campaign in place
    pub async fn update_campaign(&self, id: Uuid, f: impl FnOnce(&mut Campaign)) {
        if let Some(campaign) = self.state.lock().await.campaigns.get_mut(&id) {
            f(campaign);
        }
    }
}

#[async_trait]
impl CampaignStore for InMemoryCampaignStore {
    async fn customer_profile(
        &self,
        customer_id: Uuid,
        subscription_id: Option<Uuid>,
    ) -> BillingResult<CustomerProfile> {
        let state = self.state.lock().await;
        let (profile, _) = state
            .customers
            .get(&customer_id)
            .ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))?;
        let mut profile = profile.clone();
        if let Some(monthly) = subscription_id.and_then(|id| state.subscriptions.get(&id)) {
            profile.monthly_value_cents = *monthly;
        }
        Ok(profile)
    }

    async fn insert_campaign(&self, new: NewCampaign) -> BillingResult<CampaignInsert> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .campaigns
            .values()
            .find(|c| c.dedupe_key == new.dedupe_key && c.status.is_open())
        {
            return Ok(CampaignInsert::AlreadyOpen(existing.clone()));
        }

        let template = new.template.template();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            customer_id: new.customer_id,
            subscription_id: new.subscription_id,
            dedupe_key: new.dedupe_key,
            kind: template.kind,
            template: new.template,
            status: CampaignStatus::Active,
            current_step: 1,
            total_steps: template.total_steps(),
            anchor_at: new.anchor_at,
            next_action_at: new.next_action_at,
            success_probability: new.success_probability,
            trigger: new.trigger,
            recovered_cents: 0,
            failure_reason: None,
            locked_until: None,
            started_at: new.started_at,
            completed_at: None,
        };
        state.campaigns.insert(campaign.id, campaign.clone());
        Ok(CampaignInsert::Created(campaign))
    }

    async fn get_campaign(&self, id: Uuid) -> BillingResult<Option<Campaign>> {
        Ok(self.state.lock().await.campaigns.get(&id).cloned())
    }

    async fn open_campaign_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Campaign>> {
        let state = self.state.lock().await;
        Ok(state
            .campaigns
            .values()
            .filter(|c| c.subscription_id == Some(subscription_id) && c.status.is_open())
            .max_by_key(|c| c.started_at)
            .cloned())
    }

    async fn open_campaign_by_key(&self, dedupe_key: &str) -> BillingResult<Option<Campaign>> {
        let state = self.state.lock().await;
        Ok(state
            .campaigns
            .values()
            .find(|c| c.dedupe_key == dedupe_key && c.status.is_open())
            .cloned())
    }

    async fn claim_due(
        &self,
        now: OffsetDateTime,
        lease: Duration,
        limit: i64,
    ) -> BillingResult<Vec<Campaign>> {
        let mut state = self.state.lock().await;
        let mut due: Vec<Uuid> = state
            .campaigns
            .values()
            .filter(|c| c.is_due(now))
            .map(|c| c.id)
            .collect();
        due.sort_by_key(|id| state.campaigns.get(id).map(|c| c.next_action_at));
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(campaign) = state.campaigns.get_mut(&id) {
                campaign.locked_until = Some(now + lease);
                claimed.push(campaign.clone());
            }
        }
        Ok(claimed)
    }

    async fn campaign_context(&self, campaign: &Campaign) -> BillingResult<CampaignContext> {
        let state = self.state.lock().await;
        let (_, context) = state
            .customers
            .get(&campaign.customer_id)
            .ok_or_else(|| BillingError::CustomerNotFound(campaign.customer_id.to_string()))?;
        let mut context = context.clone();
        if let Some(amount) = campaign.trigger.amount_cents() {
            context.amount_cents = amount;
        }
        Ok(context)
    }

    async fn record_action(&self, action: NewAction) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        if state
            .actions
            .iter()
            .any(|a| a.campaign_id == action.campaign_id && a.step_number == action.step_number)
        {
            return Ok(false);
        }
        state.actions.push(DunningActionRecord {
            id: Uuid::new_v4(),
            campaign_id: action.campaign_id,
            step_number: action.step_number,
            action_type: action.action_type,
            success: action.success,
            detail: action.detail,
            executed_at: action.executed_at,
        });
        Ok(true)
    }

    async fn advance(
        &self,
        id: Uuid,
        expected_step: i32,
        next_step: i32,
        next_action_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.campaigns.get_mut(&id) {
            Some(c) if c.status == CampaignStatus::Active && c.current_step == expected_step => {
                if next_step < 1 || next_step > c.total_steps {
                    return Err(BillingError::InvalidInput(format!(
                        "step {next_step} outside 1..={}",
                        c.total_steps
                    )));
                }
                c.current_step = next_step;
                c.next_action_at = next_action_at;
                c.locked_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        id: Uuid,
        outcome: &CampaignOutcome,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.campaigns.get_mut(&id) {
            Some(c) if c.status.is_open() => {
                c.status = outcome.status();
                c.recovered_cents = outcome.recovered_cents();
                c.failure_reason = outcome.reason();
                c.completed_at = Some(now);
                c.locked_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_status(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
        next_action_at: Option<OffsetDateTime>,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.campaigns.get_mut(&id) {
            Some(c) if c.status == from => {
                c.status = to;
                if let Some(at) = next_action_at {
                    c.next_action_at = at;
                }
                c.locked_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_subscription_canceled(
        &self,
        subscription_id: Uuid,
        _now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        // A campaign can only reference a subscription that exists
        let known = state.subscriptions.contains_key(&subscription_id)
            || state
                .campaigns
                .values()
                .any(|c| c.subscription_id == Some(subscription_id));
        if !known {
            return Err(BillingError::SubscriptionNotFound(subscription_id.to_string()));
        }
        state.canceled_subscriptions.insert(subscription_id);
        Ok(())
    }

    async fn campaigns_started_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<Campaign>> {
        let state = self.state.lock().await;
        let mut campaigns: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| c.started_at >= start && c.started_at < end)
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.started_at);
        Ok(campaigns)
    }

    async fn actions_for_campaigns(
        &self,
        campaign_ids: &[Uuid],
    ) -> BillingResult<Vec<DunningActionRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .actions
            .iter()
            .filter(|a| campaign_ids.contains(&a.campaign_id))
            .cloned()
            .collect())
    }
}
