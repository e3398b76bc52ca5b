use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const PAYMENT_STATUS_COD: &str = "cod";
pub const PAYMENT_STATUS_PENDING: &str = "pending";
pub const PAYMENT_STATUS_PAID: &str = "paid";

/// Purchase record. Line items live in `order_items`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Human-readable order id shown to customers
    #[sea_orm(unique)]
    pub order_number: String,
    pub user_id: Uuid,
    pub shipping_address: Json,
    pub payment_method: String,
    pub items_price: Decimal,
    pub tax_price: Decimal,
    pub total_price: Decimal,
    pub coin_discount: Decimal,
    pub coins_used: i64,
    pub final_amount: Decimal,
    pub razorpay_order_id: Option<String>,
    pub razorpay_payment_id: Option<String>,
    pub payment_status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub status: String,
    /// Append-only list of `StatusHistoryEntry`
    pub status_history: Json,
    pub gift_evaluated: bool,
    pub stock_committed: bool,
    pub confirmation_sent: bool,
    /// True once every post-placement side effect has been applied
    pub settled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StatusHistoryEntry {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub note: String,
}

impl StatusHistoryEntry {
    pub fn now(status: &str, note: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            timestamp: Utc::now(),
            note: note.into(),
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn history(&self) -> Vec<StatusHistoryEntry> {
        serde_json::from_value(self.status_history.clone()).unwrap_or_default()
    }

    /// History with `entry` appended, ready to be written back.
    pub fn history_with(&self, entry: StatusHistoryEntry) -> Json {
        let mut history = self.history();
        history.push(entry);
        serde_json::to_value(history).unwrap_or_else(|_| Json::Array(Vec::new()))
    }
}
