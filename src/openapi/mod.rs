use utoipa::{
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "1.0.0",
        description = r#"
# Storefront Order API

Order placement for an electronics storefront, with a coin rewards ledger,
gift coupons for qualifying laptop and iPhone purchases, and a first order
referral bonus.

## Authentication

Every endpoint requires a session token, sent either as a bearer token or in
the `token` cookie:

```
Authorization: Bearer <your-jwt-token>
```

## Coins

100,000 coins redeem for a 1,000 unit discount, in whole blocks. Each order
earns 1% of its final amount back as coins.

## Error Handling

Failures share one body shape:

```json
{
  "error": "Bad Request",
  "message": "Insufficient stock for iPhone 15",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Orders", description = "Order placement and history"),
        (name = "Payments", description = "Online payment confirmation"),
        (name = "Coins", description = "Coin balance and ledger"),
        (name = "Coupons", description = "Gift coupons"),
    ),
    paths(
        crate::handlers::orders::place_order,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::payments::verify_payment,
        crate::handlers::coins::get_coins,
        crate::handlers::coupons::list_coupons,
    ),
    components(
        schemas(
            crate::services::orders::PlaceOrderRequest,
            crate::services::orders::OrderItemInput,
            crate::services::orders::PlaceOrderResponse,
            crate::services::orders::OrderView,
            crate::services::orders::OrderItemView,
            crate::services::orders::GiftCouponSummary,
            crate::services::payments::VerifyPaymentRequest,
            crate::services::coins::CoinBalance,
            crate::handlers::coins::CoinSummary,
            crate::handlers::coins::CoinTransactionView,
            crate::services::gifts::CouponView,
            crate::entities::order::StatusHistoryEntry,
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
        );
    }
}

/// Serves the generated document as JSON
pub async fn openapi_json() -> axum::Json<utoipa::openapi::OpenApi> {
    axum::Json(ApiDocV1::openapi())
}
