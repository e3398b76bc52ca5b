use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Storefront customer with a cached coin balance.
///
/// `coins` is the current balance; the `coin_transactions` table is the
/// authoritative history behind it.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    #[sea_orm(unique)]
    pub email: String,
    pub coins: i64,
    pub total_earned: i64,
    pub total_redeemed: i64,
    /// Referrer's user id, set at registration
    pub referred_by: Option<Uuid>,
    /// Coins earned from referring other users
    pub referral_total_earnings: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order::Entity")]
    Orders,
    #[sea_orm(has_many = "super::coin_transaction::Entity")]
    CoinTransactions,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Orders.def()
    }
}

impl Related<super::coin_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CoinTransactions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
