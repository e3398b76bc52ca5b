pub mod coins;
pub mod coupons;
pub mod orders;
pub mod payments;

use crate::{
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    events::EventSender,
    services::{
        coins::CoinLedgerService,
        gifts::GiftCouponService,
        notifications::{LogNotifier, OrderNotifier, WebhookNotifier},
        orders::OrderPlacementService,
        payments::{PaymentGateway, PaymentService, RazorpayClient},
    },
};
use std::sync::Arc;
use tracing::info;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderPlacementService>,
    pub coins: Arc<CoinLedgerService>,
    pub coupons: Arc<GiftCouponService>,
    pub payments: Arc<PaymentService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        gateway: Option<Arc<dyn PaymentGateway>>,
        notifier: Arc<dyn OrderNotifier>,
        currency: impl Into<String>,
    ) -> Self {
        let orders = Arc::new(OrderPlacementService::new(
            db_pool.clone(),
            event_sender.clone(),
            gateway.clone(),
            notifier,
            currency,
        ));
        let payments = Arc::new(PaymentService::new(
            db_pool.clone(),
            gateway,
            event_sender,
        ));

        Self {
            coins: orders.coins(),
            coupons: Arc::new(GiftCouponService::new(db_pool)),
            orders,
            payments,
        }
    }

    /// Builds the payment gateway and notifier from configuration.
    pub fn from_config(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
    ) -> Result<Self, ServiceError> {
        let gateway: Option<Arc<dyn PaymentGateway>> = match RazorpayClient::from_config(config)? {
            Some(client) => {
                info!("Razorpay payment gateway enabled");
                Some(Arc::new(client))
            }
            None => {
                info!("Razorpay credentials not configured; online payments disabled");
                None
            }
        };

        let notifier: Arc<dyn OrderNotifier> = match config.notification_webhook_url.as_deref() {
            Some(url) => {
                info!(url, "order confirmations delivered by webhook");
                Arc::new(WebhookNotifier::new(url)?)
            }
            None => Arc::new(LogNotifier),
        };

        Ok(Self::new(
            db_pool,
            event_sender,
            gateway,
            notifier,
            config.payment_currency.clone(),
        ))
    }
}
