//! Customer routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use coachbill_billing::{CreateCustomer, Customer};
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

pub async fn create_customer(
    State(state): State<AppState>,
    Json(request): Json<CreateCustomer>,
) -> ApiResult<(StatusCode, Json<Customer>)> {
    let customer = state.billing.customers.create_customer(&request).await?;
    Ok((StatusCode::CREATED, Json(customer)))
}

pub async fn get_customer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Customer>> {
    let customer = state.billing.customers.get_customer(id).await?;
    Ok(Json(customer))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};

    use crate::routes::test_support::{router, send};

    #[tokio::test]
    async fn invalid_email_is_rejected_before_insert() {
        let request = Request::builder()
            .method("POST")
            .uri("/customers")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"email":"not-an-email","name":"Ada Lovelace"}"#))
            .unwrap();
        let (status, body) = send(router(None), request).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"]["code"], "invalid_request");
    }
}
