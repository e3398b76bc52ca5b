use crate::{
    db::DbPool,
    entities::{
        coin_transaction::{self, CoinTransactionType, Entity as CoinTransactionEntity},
        user::{self, Entity as UserEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    metrics,
};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// Coins that buy one discount block
pub const COINS_PER_DISCOUNT_BLOCK: i64 = 100_000;
/// Currency value of one discount block
pub const DISCOUNT_BLOCK_VALUE: i64 = 1_000;
/// Share of the order's final amount paid back as coins
pub const PURCHASE_REWARD_RATE: Decimal = dec!(0.01);

pub const SOURCE_ORDER_REDEMPTION: &str = "order_redemption";
pub const SOURCE_ORDER_PURCHASE: &str = "order_purchase";
pub const SOURCE_REFERRAL_FIRST_ORDER: &str = "referral_first_order";

pub const REFERENCE_ORDER: &str = "Order";
pub const REFERENCE_REFERRAL: &str = "Referral";

/// Largest discount `coins` can buy, rounded down to a whole block.
pub fn max_discount_for(coins: i64) -> Decimal {
    if coins <= 0 {
        return Decimal::ZERO;
    }
    Decimal::from((coins / COINS_PER_DISCOUNT_BLOCK) * DISCOUNT_BLOCK_VALUE)
}

/// Coins earned for an order: 1% of the final amount, floored.
pub fn purchase_reward_for(final_amount: Decimal) -> i64 {
    (final_amount * PURCHASE_REWARD_RATE)
        .floor()
        .to_i64()
        .unwrap_or(0)
        .max(0)
}

/// Checks a requested redemption against the user's balance.
pub fn check_redemption(
    available_coins: i64,
    coins_used: i64,
    coin_discount: Decimal,
    total_price: Decimal,
) -> Result<(), ServiceError> {
    if coins_used < 0 || coin_discount < Decimal::ZERO {
        return Err(ServiceError::BadRequest(
            "Coin values cannot be negative".to_string(),
        ));
    }

    if coins_used == 0 {
        if coin_discount > Decimal::ZERO {
            return Err(ServiceError::InvalidDiscount(
                "Coin discount requires coins to be used".to_string(),
            ));
        }
        return Ok(());
    }

    if coins_used > available_coins {
        return Err(ServiceError::InsufficientCoins(format!(
            "Insufficient coins: requested {}, available {}",
            coins_used, available_coins
        )));
    }

    let max_discount = max_discount_for(available_coins);
    if coin_discount > max_discount {
        return Err(ServiceError::InvalidDiscount(format!(
            "Invalid coin discount: maximum allowed is {}",
            max_discount
        )));
    }

    if coin_discount > total_price {
        return Err(ServiceError::InvalidDiscount(
            "Coin discount cannot exceed the order total".to_string(),
        ));
    }

    Ok(())
}

/// Result of an idempotent ledger write
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOutcome {
    Applied(coin_transaction::Model),
    AlreadyApplied,
    Skipped,
}

/// A balance-affecting event to append to the ledger
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub user_id: Uuid,
    pub transaction_type: CoinTransactionType,
    pub amount: i64,
    pub source: &'static str,
    pub description: String,
    pub reference_id: Uuid,
    pub reference_model: &'static str,
    pub metadata: Option<serde_json::Value>,
}

pub async fn ledger_entry_exists<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    source: &str,
    reference_id: Uuid,
) -> Result<bool, ServiceError> {
    let existing = CoinTransactionEntity::find()
        .filter(coin_transaction::Column::UserId.eq(user_id))
        .filter(coin_transaction::Column::Source.eq(source))
        .filter(coin_transaction::Column::ReferenceId.eq(reference_id))
        .one(conn)
        .await?;
    Ok(existing.is_some())
}

async fn current_balance<C: ConnectionTrait>(conn: &C, user_id: Uuid) -> Result<i64, ServiceError> {
    UserEntity::find_by_id(user_id)
        .one(conn)
        .await?
        .map(|u| u.coins)
        .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))
}

async fn append_entry<C: ConnectionTrait>(
    conn: &C,
    entry: &LedgerEntry,
    balance_after: i64,
) -> Result<coin_transaction::Model, ServiceError> {
    let model = coin_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(entry.user_id),
        transaction_type: Set(entry.transaction_type),
        amount: Set(entry.amount),
        source: Set(entry.source.to_string()),
        description: Set(entry.description.clone()),
        reference_id: Set(Some(entry.reference_id)),
        reference_model: Set(Some(entry.reference_model.to_string())),
        balance_after: Set(balance_after),
        metadata: Set(entry.metadata.clone()),
        created_at: Set(Utc::now()),
    };
    Ok(model.insert(conn).await?)
}

/// Adds coins to a user and records the ledger entry, on the caller's connection.
///
/// Returns `None` when an entry with the same ledger key already exists.
pub async fn credit_coins<C: ConnectionTrait>(
    conn: &C,
    entry: &LedgerEntry,
) -> Result<Option<coin_transaction::Model>, ServiceError> {
    if ledger_entry_exists(conn, entry.user_id, entry.source, entry.reference_id).await? {
        return Ok(None);
    }

    let updated = UserEntity::update_many()
        .col_expr(
            user::Column::Coins,
            Expr::col(user::Column::Coins).add(entry.amount),
        )
        .col_expr(
            user::Column::TotalEarned,
            Expr::col(user::Column::TotalEarned).add(entry.amount),
        )
        .col_expr(user::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(user::Column::Id.eq(entry.user_id))
        .exec(conn)
        .await?;
    if updated.rows_affected == 0 {
        return Err(ServiceError::NotFound("User not found".to_string()));
    }

    let balance_after = current_balance(conn, entry.user_id).await?;
    append_entry(conn, entry, balance_after).await.map(Some)
}

/// Removes coins from a user and records the ledger entry. The balance never
/// goes below zero.
pub async fn debit_coins<C: ConnectionTrait>(
    conn: &C,
    entry: &LedgerEntry,
) -> Result<Option<coin_transaction::Model>, ServiceError> {
    if ledger_entry_exists(conn, entry.user_id, entry.source, entry.reference_id).await? {
        return Ok(None);
    }

    let updated = UserEntity::update_many()
        .col_expr(
            user::Column::Coins,
            Expr::col(user::Column::Coins).sub(entry.amount),
        )
        .col_expr(
            user::Column::TotalRedeemed,
            Expr::col(user::Column::TotalRedeemed).add(entry.amount),
        )
        .col_expr(user::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(user::Column::Id.eq(entry.user_id))
        .filter(user::Column::Coins.gte(entry.amount))
        .exec(conn)
        .await?;
    if updated.rows_affected == 0 {
        let available = current_balance(conn, entry.user_id).await?;
        return Err(ServiceError::InsufficientCoins(format!(
            "Insufficient coins: requested {}, available {}",
            entry.amount, available
        )));
    }

    let balance_after = current_balance(conn, entry.user_id).await?;
    append_entry(conn, entry, balance_after).await.map(Some)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CoinBalance {
    pub user_id: Uuid,
    pub coins: i64,
    pub total_earned: i64,
    pub total_redeemed: i64,
    pub referral_total_earnings: i64,
    /// Discount the current balance can buy
    pub max_discount: Decimal,
}

/// Coin balance bookkeeping over the `users` and `coin_transactions` tables
#[derive(Clone)]
pub struct CoinLedgerService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl CoinLedgerService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Debits the coins a customer spent on an order.
    #[instrument(skip(self), fields(user_id = %user_id, order_id = %order_id))]
    pub async fn redeem_for_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        order_number: &str,
        coins: i64,
    ) -> Result<LedgerOutcome, ServiceError> {
        if coins <= 0 {
            return Ok(LedgerOutcome::Skipped);
        }

        let entry = LedgerEntry {
            user_id,
            transaction_type: CoinTransactionType::Redeemed,
            amount: coins,
            source: SOURCE_ORDER_REDEMPTION,
            description: format!("Redeemed for order {}", order_number),
            reference_id: order_id,
            reference_model: REFERENCE_ORDER,
            metadata: Some(serde_json::json!({
                "orderNumber": order_number,
                "discountValue": max_discount_for(coins),
            })),
        };

        let txn = self.db_pool.begin().await?;
        let written = debit_coins(&txn, &entry).await?;
        txn.commit().await?;

        match written {
            Some(tx) => {
                metrics::COINS_REDEEMED.inc_by(coins as u64);
                info!(coins, balance_after = tx.balance_after, "coins redeemed");
                self.event_sender
                    .send_or_log(Event::CoinsRedeemed {
                        user_id,
                        order_id,
                        coins,
                        balance_after: tx.balance_after,
                    })
                    .await;
                Ok(LedgerOutcome::Applied(tx))
            }
            None => Ok(LedgerOutcome::AlreadyApplied),
        }
    }

    /// Credits the purchase reward for an order.
    #[instrument(skip(self), fields(user_id = %user_id, order_id = %order_id))]
    pub async fn award_for_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        order_number: &str,
        coins: i64,
    ) -> Result<LedgerOutcome, ServiceError> {
        if coins <= 0 {
            return Ok(LedgerOutcome::Skipped);
        }

        let entry = LedgerEntry {
            user_id,
            transaction_type: CoinTransactionType::Earned,
            amount: coins,
            source: SOURCE_ORDER_PURCHASE,
            description: format!("Earned from order {}", order_number),
            reference_id: order_id,
            reference_model: REFERENCE_ORDER,
            metadata: Some(serde_json::json!({ "orderNumber": order_number })),
        };

        let txn = self.db_pool.begin().await?;
        let written = credit_coins(&txn, &entry).await.map_err(|e| {
            error!(error = %e, "failed to credit purchase reward");
            e
        })?;
        txn.commit().await?;

        match written {
            Some(tx) => {
                metrics::COINS_AWARDED.inc_by(coins as u64);
                info!(coins, balance_after = tx.balance_after, "coins awarded");
                self.event_sender
                    .send_or_log(Event::CoinsEarned {
                        user_id,
                        order_id,
                        coins,
                        balance_after: tx.balance_after,
                    })
                    .await;
                Ok(LedgerOutcome::Applied(tx))
            }
            None => Ok(LedgerOutcome::AlreadyApplied),
        }
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<CoinBalance, ServiceError> {
        let user = UserEntity::find_by_id(user_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

        Ok(CoinBalance {
            user_id: user.id,
            coins: user.coins,
            total_earned: user.total_earned,
            total_redeemed: user.total_redeemed,
            referral_total_earnings: user.referral_total_earnings,
            max_discount: max_discount_for(user.coins),
        })
    }

    /// Most recent ledger entries first.
    pub async fn history(
        &self,
        user_id: Uuid,
        limit: u64,
    ) -> Result<Vec<coin_transaction::Model>, ServiceError> {
        Ok(CoinTransactionEntity::find()
            .filter(coin_transaction::Column::UserId.eq(user_id))
            .order_by_desc(coin_transaction::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db_pool)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, dec!(0))]
    #[case(99_999, dec!(0))]
    #[case(100_000, dec!(1000))]
    #[case(250_000, dec!(2000))]
    #[case(1_999_999, dec!(19000))]
    fn max_discount_rounds_down_to_whole_blocks(#[case] coins: i64, #[case] expected: Decimal) {
        assert_eq!(max_discount_for(coins), expected);
    }

    #[rstest]
    #[case(dec!(12345), 123)]
    #[case(dec!(59000), 590)]
    #[case(dec!(57000), 570)]
    #[case(dec!(99.99), 0)]
    #[case(dec!(0), 0)]
    fn purchase_reward_is_one_percent_floored(#[case] amount: Decimal, #[case] expected: i64) {
        assert_eq!(purchase_reward_for(amount), expected);
    }

    #[test]
    fn redemption_within_balance_is_accepted() {
        assert!(check_redemption(250_000, 200_000, dec!(2000), dec!(59000)).is_ok());
        assert!(check_redemption(0, 0, Decimal::ZERO, dec!(100)).is_ok());
    }

    #[test]
    fn redemption_beyond_balance_is_rejected() {
        assert_matches!(
            check_redemption(1_500, 200_000, dec!(2000), dec!(59000)),
            Err(ServiceError::InsufficientCoins(_))
        );
    }

    #[test]
    fn discount_above_block_allowance_is_rejected() {
        assert_matches!(
            check_redemption(250_000, 200_000, dec!(3000), dec!(59000)),
            Err(ServiceError::InvalidDiscount(_))
        );
    }

    #[test]
    fn discount_allowance_follows_balance_not_coins_used() {
        assert_matches!(
            check_redemption(250_000, 100_000, dec!(2000), dec!(59000)),
            Ok(())
        );
        assert_matches!(
            check_redemption(250_000, 0, dec!(1000), dec!(59000)),
            Err(ServiceError::InvalidDiscount(_))
        );
    }

    #[test]
    fn negative_values_are_bad_requests() {
        assert_matches!(
            check_redemption(100, -1, Decimal::ZERO, dec!(10)),
            Err(ServiceError::BadRequest(_))
        );
    }

    proptest! {
        #[test]
        fn max_discount_never_exceeds_coin_value(coins in 0i64..10_000_000_000) {
            let discount = max_discount_for(coins);
            prop_assert!(discount * Decimal::from(COINS_PER_DISCOUNT_BLOCK) <= Decimal::from(coins) * Decimal::from(DISCOUNT_BLOCK_VALUE));
            prop_assert_eq!(discount % Decimal::from(DISCOUNT_BLOCK_VALUE), Decimal::ZERO);
        }

        #[test]
        fn reward_matches_integer_floor(cents in 0i64..1_000_000_000) {
            let amount = Decimal::new(cents, 2);
            prop_assert_eq!(purchase_reward_for(amount), cents / 10_000);
        }
    }
}
