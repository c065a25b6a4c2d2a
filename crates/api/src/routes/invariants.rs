use axum::{extract::State, Json};
use coachbill_billing::InvariantCheckSummary;

use crate::{error::ApiResult, state::AppState};

pub async fn run_checks(State(state): State<AppState>) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.billing.invariants.run_all_checks().await?;
    Ok(Json(summary))
}
