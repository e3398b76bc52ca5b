use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::{orders::OrderView, payments::VerifyPaymentRequest},
    ApiResponse, AppState,
};
use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};

pub fn payment_routes() -> Router<AppState> {
    Router::new().route("/verify", post(verify_payment))
}

/// Confirm a Razorpay payment and mark the order paid
#[utoipa::path(
    post,
    path = "/api/v1/payments/verify",
    summary = "Verify payment",
    request_body = VerifyPaymentRequest,
    responses(
        (status = 200, description = "Payment verified", body = ApiResponse<OrderView>),
        (status = 400, description = "Missing fields or bad signature", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 500, description = "Payment gateway not configured", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    auth_user: AuthUser,
    body: Result<Json<VerifyPaymentRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<OrderView>>, ServiceError> {
    let Json(request) = body.map_err(|e| ServiceError::BadRequest(e.body_text()))?;

    let paid = state
        .services
        .payments
        .verify_payment(auth_user.user_id, request)
        .await?;
    let order = state
        .services
        .orders
        .get_user_order(auth_user.user_id, &paid.order_number)
        .await?;

    Ok(Json(ApiResponse::success(order)))
}
