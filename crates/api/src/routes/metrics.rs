use axum::{
    extract::{Query, State},
    Json,
};
use coachbill_billing::RevenueMetrics;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub days: Option<i64>,
}

impl WindowQuery {
    /// Reporting window in days, 30 by default and at most two years
    pub fn days(&self) -> ApiResult<i64> {
        let days = self.days.unwrap_or(30);
        if !(1..=730).contains(&days) {
            return Err(ApiError::Validation(format!(
                "days must be between 1 and 730, got {days}"
            )));
        }
        Ok(days)
    }
}

pub async fn revenue(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Json<RevenueMetrics>> {
    let end = OffsetDateTime::now_utc();
    let start = end - Duration::days(query.days()?);
    let metrics = state.billing.metrics.compute(start, end).await?;
    Ok(Json(metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_defaults_and_bounds() {
        assert_eq!(WindowQuery { days: None }.days().unwrap(), 30);
        assert_eq!(WindowQuery { days: Some(730) }.days().unwrap(), 730);
        assert!(WindowQuery { days: Some(0) }.days().is_err());
        assert!(WindowQuery { days: Some(-5) }.days().is_err());
        assert!(WindowQuery { days: Some(731) }.days().is_err());
    }
}
