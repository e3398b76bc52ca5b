use crate::{
    db::DbPool,
    entities::{
        coin_transaction::CoinTransactionType,
        referral::{self, Entity as ReferralEntity},
        user::{self, Entity as UserEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    metrics,
    services::coins::{self, LedgerEntry},
};
use chrono::Utc;
use sea_orm::{sea_query::Expr, ColumnTrait, EntityTrait, QueryFilter, TransactionTrait};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Coins paid to a referrer when their referral places a first order
pub const REFERRAL_FIRST_ORDER_BONUS: i64 = 5_000;

/// Outcome of a credited first-order bonus
#[derive(Debug, Clone)]
pub struct ReferralCredit {
    pub referral_id: Uuid,
    pub referrer_id: Uuid,
    pub coins: i64,
    pub referrer_balance_after: i64,
}

#[derive(Clone)]
pub struct ReferralService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl ReferralService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Pays the referrer of `purchaser` once, on their first completed order.
    ///
    /// Only the caller that flips `first_order_completed` pays out; every
    /// other call returns `Ok(None)`.
    #[instrument(skip(self, purchaser), fields(user_id = %purchaser.id, order_id = %order_id))]
    pub async fn credit_first_order(
        &self,
        purchaser: &user::Model,
        order_id: Uuid,
    ) -> Result<Option<ReferralCredit>, ServiceError> {
        let Some(referrer_id) = purchaser.referred_by else {
            return Ok(None);
        };

        let txn = self.db_pool.begin().await?;

        let Some(referral) = ReferralEntity::find()
            .filter(referral::Column::ReferrerId.eq(referrer_id))
            .filter(referral::Column::ReferredId.eq(purchaser.id))
            .one(&txn)
            .await?
        else {
            debug!(%referrer_id, "no referral record for referred user");
            return Ok(None);
        };

        if referral.first_order_completed {
            return Ok(None);
        }

        let now = Utc::now();
        let flipped = ReferralEntity::update_many()
            .col_expr(referral::Column::FirstOrderCompleted, Expr::value(true))
            .col_expr(referral::Column::FirstOrderDate, Expr::value(now))
            .col_expr(
                referral::Column::Status,
                Expr::value(referral::STATUS_COMPLETED),
            )
            .col_expr(
                referral::Column::OrderReward,
                Expr::value(REFERRAL_FIRST_ORDER_BONUS),
            )
            .col_expr(
                referral::Column::TotalRewards,
                Expr::col(referral::Column::TotalRewards).add(REFERRAL_FIRST_ORDER_BONUS),
            )
            .col_expr(referral::Column::UpdatedAt, Expr::value(now))
            .filter(referral::Column::Id.eq(referral.id))
            .filter(referral::Column::FirstOrderCompleted.eq(false))
            .exec(&txn)
            .await?;

        if flipped.rows_affected == 0 {
            debug!(referral_id = %referral.id, "first-order bonus already claimed");
            return Ok(None);
        }

        let entry = LedgerEntry {
            user_id: referrer_id,
            transaction_type: CoinTransactionType::Earned,
            amount: REFERRAL_FIRST_ORDER_BONUS,
            source: coins::SOURCE_REFERRAL_FIRST_ORDER,
            description: format!("Referral bonus: {} placed their first order", purchaser.name),
            reference_id: referral.id,
            reference_model: coins::REFERENCE_REFERRAL,
            metadata: Some(serde_json::json!({
                "referredUserId": purchaser.id,
                "orderId": order_id,
            })),
        };

        let Some(ledger) = coins::credit_coins(&txn, &entry).await? else {
            return Ok(None);
        };

        UserEntity::update_many()
            .col_expr(
                user::Column::ReferralTotalEarnings,
                Expr::col(user::Column::ReferralTotalEarnings).add(REFERRAL_FIRST_ORDER_BONUS),
            )
            .filter(user::Column::Id.eq(referrer_id))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        metrics::REFERRAL_BONUSES.inc();
        info!(
            referral_id = %referral.id,
            %referrer_id,
            coins = REFERRAL_FIRST_ORDER_BONUS,
            "referral first-order bonus credited"
        );
        self.event_sender
            .send_or_log(Event::ReferralBonusCredited {
                referral_id: referral.id,
                referrer_id,
                referred_id: purchaser.id,
                coins: REFERRAL_FIRST_ORDER_BONUS,
            })
            .await;

        Ok(Some(ReferralCredit {
            referral_id: referral.id,
            referrer_id,
            coins: REFERRAL_FIRST_ORDER_BONUS,
            referrer_balance_after: ledger.balance_after,
        }))
    }
}
