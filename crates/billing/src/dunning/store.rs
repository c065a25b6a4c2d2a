//! Persistence seam for the dunning engine

use async_trait::async_trait;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::campaign::{
    ActionType, Campaign, CampaignInsert, CampaignOutcome, CampaignStatus, DunningActionRecord,
    NewCampaign,
};
use super::scoring::CustomerProfile;
use crate::error::BillingResult;

/// Who a campaign is talking to and what is owed
#[derive(Debug, Clone, Default, Serialize)]
pub struct CampaignContext {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub plan_name: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
}

impl CampaignContext {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct NewAction {
    pub campaign_id: Uuid,
    pub step_number: i32,
    pub action_type: ActionType,
    pub success: bool,
    pub detail: serde_json::Value,
    pub executed_at: OffsetDateTime,
}

/// Storage operations the engine needs.
///
/// Every state change is conditional on the state the caller last saw, so two
/// workers racing on the same campaign cannot both apply a transition. The
/// boolean results report whether this caller's write won.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn customer_profile(
        &self,
        customer_id: Uuid,
        subscription_id: Option<Uuid>,
    ) -> BillingResult<CustomerProfile>;

    /// Insert unless an open campaign already holds the dedupe key
    async fn insert_campaign(&self, campaign: NewCampaign) -> BillingResult<CampaignInsert>;

    async fn get_campaign(&self, id: Uuid) -> BillingResult<Option<Campaign>>;

    async fn open_campaign_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Campaign>>;

    /// Open campaign holding `dedupe_key`
    async fn open_campaign_by_key(&self, dedupe_key: &str) -> BillingResult<Option<Campaign>>;

    /// Lease up to `limit` due campaigns until `now + lease`
    async fn claim_due(
        &self,
        now: OffsetDateTime,
        lease: Duration,
        limit: i64,
    ) -> BillingResult<Vec<Campaign>>;

    async fn campaign_context(&self, campaign: &Campaign) -> BillingResult<CampaignContext>;

    /// Returns false if the step was already recorded
    async fn record_action(&self, action: NewAction) -> BillingResult<bool>;

    /// Move an active campaign from `expected_step` to `next_step` and drop its lease
    async fn advance(
        &self,
        id: Uuid,
        expected_step: i32,
        next_step: i32,
        next_action_at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Close an open campaign
    async fn complete(
        &self,
        id: Uuid,
        outcome: &CampaignOutcome,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn set_status(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
        next_action_at: Option<OffsetDateTime>,
    ) -> BillingResult<bool>;

    async fn mark_subscription_canceled(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<()>;

    async fn campaigns_started_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<Campaign>>;

    async fn actions_for_campaigns(
        &self,
        campaign_ids: &[Uuid],
    ) -> BillingResult<Vec<DunningActionRecord>>;
}
