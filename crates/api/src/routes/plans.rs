use axum::Json;
use coachbill_billing::Plan;

pub async fn list_plans() -> Json<&'static [Plan]> {
    Json(Plan::all())
}
