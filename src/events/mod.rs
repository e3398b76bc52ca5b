use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "dropping domain event");
        }
    }
}

/// Domain events raised by the order and rewards workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    OrderPlaced {
        order_id: Uuid,
        order_number: String,
        user_id: Uuid,
        final_amount: Decimal,
        payment_method: String,
    },
    GiftCouponIssued {
        order_id: Uuid,
        coupon_code: String,
        gift_product_id: Uuid,
        category: String,
    },
    CoinsRedeemed {
        user_id: Uuid,
        order_id: Uuid,
        coins: i64,
        balance_after: i64,
    },
    CoinsEarned {
        user_id: Uuid,
        order_id: Uuid,
        coins: i64,
        balance_after: i64,
    },
    ReferralBonusCredited {
        referral_id: Uuid,
        referrer_id: Uuid,
        referred_id: Uuid,
        coins: i64,
    },
    StockCommitted {
        order_id: Uuid,
        shortfalls: Vec<Uuid>,
    },
    PaymentVerified {
        order_id: Uuid,
        payment_id: String,
        paid_at: DateTime<Utc>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderPlaced { .. } => "order_placed",
            Event::GiftCouponIssued { .. } => "gift_coupon_issued",
            Event::CoinsRedeemed { .. } => "coins_redeemed",
            Event::CoinsEarned { .. } => "coins_earned",
            Event::ReferralBonusCredited { .. } => "referral_bonus_credited",
            Event::StockCommitted { .. } => "stock_committed",
            Event::PaymentVerified { .. } => "payment_verified",
        }
    }
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderPlaced {
                order_id,
                order_number,
                user_id,
                final_amount,
                payment_method,
            } => info!(
                event = event.name(),
                %order_id,
                order_number = %order_number,
                %user_id,
                %final_amount,
                payment_method = %payment_method,
                "order placed"
            ),
            Event::GiftCouponIssued {
                order_id,
                coupon_code,
                gift_product_id,
                category,
            } => info!(
                event = event.name(),
                %order_id,
                coupon_code = %coupon_code,
                %gift_product_id,
                category = %category,
                "gift coupon issued"
            ),
            Event::CoinsRedeemed {
                user_id,
                order_id,
                coins,
                balance_after,
            }
            | Event::CoinsEarned {
                user_id,
                order_id,
                coins,
                balance_after,
            } => info!(
                event = event.name(),
                %user_id,
                %order_id,
                coins,
                balance_after,
                "coin ledger updated"
            ),
            Event::ReferralBonusCredited {
                referral_id,
                referrer_id,
                referred_id,
                coins,
            } => info!(
                event = event.name(),
                %referral_id,
                %referrer_id,
                %referred_id,
                coins,
                "referral bonus credited"
            ),
            Event::StockCommitted {
                order_id,
                shortfalls,
            } => {
                if shortfalls.is_empty() {
                    info!(event = event.name(), %order_id, "stock committed");
                } else {
                    warn!(
                        event = event.name(),
                        %order_id,
                        shortfalls = ?shortfalls,
                        "stock committed with shortfalls"
                    );
                }
            }
            Event::PaymentVerified {
                order_id,
                payment_id,
                paid_at,
            } => info!(
                event = event.name(),
                %order_id,
                payment_id = %payment_id,
                %paid_at,
                "payment verified"
            ),
        }
    }

    info!("Event processing loop stopped");
}
