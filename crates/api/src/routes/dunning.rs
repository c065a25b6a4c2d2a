//! Dunning campaign routes

use axum::{
    extract::{Path, Query, State},
    Json,
};
use coachbill_billing::{Campaign, CampaignDetail, RecoveryAnalytics};
use time::OffsetDateTime;
use uuid::Uuid;

use super::metrics::WindowQuery;
use crate::{error::ApiResult, state::AppState};

pub async fn analytics(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Json<RecoveryAnalytics>> {
    let analytics = state
        .billing
        .dunning
        .recovery_analytics(query.days()?, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(analytics))
}

pub async fn get_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CampaignDetail>> {
    let detail = state.billing.dunning.campaign_detail(id).await?;
    Ok(Json(detail))
}

pub async fn pause(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Campaign>> {
    let campaign = state.billing.dunning.pause(id).await?;
    Ok(Json(campaign))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Campaign>> {
    let campaign = state
        .billing
        .dunning
        .resume(id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(campaign))
}
