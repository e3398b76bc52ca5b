/*!
 * # Metrics
 *
 * Prometheus counters for the checkout and rewards workflow, exposed in text
 * format at `/metrics`.
 */

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref ORDERS_PLACED: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("storefront_orders_placed_total", "Total number of orders placed"),
        &["payment_method"]
    )
    .expect("metric can be created");
    pub static ref ORDER_PLACEMENT_FAILURES: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "storefront_order_placement_failures_total",
            "Total number of rejected or failed checkouts"
        ),
        &["reason"]
    )
    .expect("metric can be created");
    pub static ref GIFT_COUPONS_ISSUED: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "storefront_gift_coupons_issued_total",
            "Total number of gift coupons issued"
        ),
        &["category"]
    )
    .expect("metric can be created");
    pub static ref COINS_REDEEMED: IntCounter = IntCounter::new(
        "storefront_coins_redeemed_total",
        "Total coins redeemed against orders"
    )
    .expect("metric can be created");
    pub static ref COINS_AWARDED: IntCounter = IntCounter::new(
        "storefront_coins_awarded_total",
        "Total coins awarded for purchases"
    )
    .expect("metric can be created");
    pub static ref REFERRAL_BONUSES: IntCounter = IntCounter::new(
        "storefront_referral_bonuses_total",
        "Total number of referral first-order bonuses credited"
    )
    .expect("metric can be created");
    pub static ref SETTLEMENT_FAILURES: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "storefront_settlement_failures_total",
            "Total number of failed post-placement settlement steps"
        ),
        &["step"]
    )
    .expect("metric can be created");
}

/// Registers every collector with [`REGISTRY`]. Safe to call more than once.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ORDERS_PLACED.clone()),
        Box::new(ORDER_PLACEMENT_FAILURES.clone()),
        Box::new(GIFT_COUPONS_ISSUED.clone()),
        Box::new(COINS_REDEEMED.clone()),
        Box::new(COINS_AWARDED.clone()),
        Box::new(REFERRAL_BONUSES.clone()),
        Box::new(SETTLEMENT_FAILURES.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => error!(error = %e, "failed to register metric"),
        }
    }
}

pub fn export_metrics() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub async fn metrics_handler() -> Response {
    match export_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to export metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
