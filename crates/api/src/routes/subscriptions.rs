//! Subscription routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use coachbill_billing::{CreateSubscription, Subscription};
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

pub async fn create_subscription(
    State(state): State<AppState>,
    Json(request): Json<CreateSubscription>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    let subscription = state
        .billing
        .subscriptions
        .create_subscription(&request)
        .await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state.billing.subscriptions.get_subscription(id).await?;
    Ok(Json(subscription))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use uuid::Uuid;

    use crate::routes::test_support::{router, send};

    #[tokio::test]
    async fn unknown_plan_is_not_found() {
        let request = Request::builder()
            .method("POST")
            .uri("/subscriptions")
            .header("content-type", "application/json")
            .body(Body::from(format!(
                r#"{{"customer_id":"{}","plan_id":"platinum"}}"#,
                Uuid::new_v4()
            )))
            .unwrap();
        let (status, body) = send(router(None), request).await;
        assert_eq!(status, 404);
        assert_eq!(body["error"]["code"], "not_found");
    }
}
