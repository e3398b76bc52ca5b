use crate::{
    auth::AuthUser, errors::ServiceError, services::gifts::CouponView, ApiResponse, AppState,
};
use axum::{extract::State, routing::get, Json, Router};

pub fn coupon_routes() -> Router<AppState> {
    Router::new().route("/", get(list_coupons))
}

/// Gift coupons issued to the caller
#[utoipa::path(
    get,
    path = "/api/v1/coupons",
    summary = "List my gift coupons",
    responses(
        (status = 200, description = "Coupons retrieved", body = ApiResponse<Vec<CouponView>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn list_coupons(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<Vec<CouponView>>>, ServiceError> {
    let coupons = state
        .services
        .coupons
        .list_for_user(auth_user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(coupons)))
}
