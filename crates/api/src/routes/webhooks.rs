//! Payment processor webhook endpoint and replay tools

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use coachbill_billing::{
    webhooks::WebhookStatsSnapshot, BillingError, WebhookEventRecord, WebhookOutcome,
    WebhookReplayResult,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

/// Receive a signed event.
///
/// Signature and payload problems are 400s and will not be retried by the
/// processor. Any other processing failure is a 500 so the event is redelivered.
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook received without signature header");
            ApiError::InvalidSignature
        })?;

    let webhooks = &state.billing.webhooks;
    let event = webhooks.verify_event(&body, signature)?;

    match webhooks.handle_event(&event).await {
        Ok(outcome) => Ok(Json(WebhookAck {
            received: true,
            outcome,
        })),
        Err(e) => Err(processing_error(&event.id, &event.event_type, e)),
    }
}

fn processing_error(event_id: &str, event_type: &str, err: BillingError) -> ApiError {
    if err.is_malformed_payload() {
        return err.into();
    }
    ApiError::Internal(format!("webhook {event_id} ({event_type}) failed: {err}"))
}

pub async fn stats(State(state): State<AppState>) -> Json<WebhookStatsSnapshot> {
    Json(state.billing.webhooks.stats())
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_failed(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    let records = state.billing.webhooks.list_failed(limit, offset).await?;
    Ok(Json(records))
}

pub async fn replay(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    let result = state.billing.webhooks.replay(&event_id).await?;
    Ok(Json(result))
}
