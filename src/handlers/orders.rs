use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::orders::{OrderView, PlaceOrderRequest, PlaceOrderResponse},
    ApiResponse, AppState,
};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders).post(place_order))
        .route("/:order_number", get(get_order))
}

/// Place an order for the authenticated customer
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    summary = "Place order",
    description = "Validates the cart and coin redemption, opens a gateway order for online payments, stores the order and applies gift, coin, referral and stock side effects",
    request_body = PlaceOrderRequest,
    responses(
        (status = 201, description = "Order placed", body = ApiResponse<PlaceOrderResponse>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Missing fields, insufficient stock or coins, or invalid discount", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "User not found", body = crate::errors::ErrorResponse),
        (status = 500, description = "Payment gateway or internal error", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn place_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    body: Result<Json<PlaceOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<PlaceOrderResponse>>), ServiceError> {
    let Json(request) = body.map_err(|e| ServiceError::BadRequest(e.body_text()))?;

    let placed = state
        .services
        .orders
        .place_order(auth_user.user_id, request)
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(placed))))
}

/// List the caller's orders, newest first
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List my orders",
    responses(
        (status = 200, description = "Orders retrieved", body = ApiResponse<Vec<OrderView>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<Vec<OrderView>>>, ServiceError> {
    let orders = state
        .services
        .orders
        .list_user_orders(auth_user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(orders)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{order_number}",
    summary = "Get one of my orders",
    params(("order_number" = String, Path, description = "Public order number, e.g. ORD-20240309-AB12CD")),
    responses(
        (status = 200, description = "Order retrieved", body = ApiResponse<OrderView>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(order_number): Path<String>,
) -> Result<Json<ApiResponse<OrderView>>, ServiceError> {
    let order = state
        .services
        .orders
        .get_user_order(auth_user.user_id, &order_number)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}
