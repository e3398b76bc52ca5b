use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const COUPON_TYPE_GIFT: &str = "gift";

/// Gift voucher issued alongside a qualifying order
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "coupons")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub code: String,
    pub coupon_type: String,
    /// Snapshot of the gift product at issuance
    pub gift_item: Json,
    pub gift_product_id: Uuid,
    pub valid_until: DateTime<Utc>,
    pub usage_limit: i32,
    pub used_count: i32,
    pub assigned_to: Uuid,
    #[sea_orm(unique)]
    pub source_order_id: Uuid,
    pub is_active: bool,
    pub metadata: Json,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::SourceOrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
