use crate::{
    db::DbPool,
    entities::{
        order::{self, Entity as OrderEntity, StatusHistoryEntry},
        order_item::{self, Entity as OrderItemEntity},
        product::{self, Entity as ProductEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// One requested line of a checkout
#[derive(Debug, Clone)]
pub struct StockRequest {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
}

/// Result of committing an order's stock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockCommit {
    Committed { shortfalls: Vec<Uuid> },
    AlreadyCommitted,
}

#[derive(Clone)]
pub struct InventoryService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl InventoryService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Rejects the checkout if any product is missing or short. Nothing is
    /// reserved; `commit_stock` applies the decrement later.
    #[instrument(skip(self, items), fields(lines = items.len()))]
    pub async fn validate_stock(&self, items: &[StockRequest]) -> Result<(), ServiceError> {
        for item in items {
            let product = ProductEntity::find_by_id(item.product_id)
                .one(&*self.db_pool)
                .await?;

            match product {
                None => {
                    return Err(ServiceError::InsufficientStock(format!(
                        "Product not found: {}",
                        item.name
                    )))
                }
                Some(p) if p.stock < item.quantity => {
                    return Err(ServiceError::InsufficientStock(format!(
                        "Insufficient stock for {}",
                        p.name
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Decrements stock for every purchased (non-gift) line of the order,
    /// exactly once per order.
    ///
    /// A product that can no longer cover its quantity is clamped to zero and
    /// the shortfall is noted on the order's status history.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn commit_stock(&self, order_id: Uuid) -> Result<StockCommit, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let now = Utc::now();

        let claimed = OrderEntity::update_many()
            .col_expr(order::Column::StockCommitted, Expr::value(true))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::StockCommitted.eq(false))
            .exec(&txn)
            .await?;
        if claimed.rows_affected == 0 {
            return Ok(StockCommit::AlreadyCommitted);
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .filter(order_item::Column::IsGift.eq(false))
            .order_by_asc(order_item::Column::Position)
            .all(&txn)
            .await?;

        let mut shortfalls = Vec::new();
        let mut short_names = Vec::new();
        for item in &items {
            let decremented = ProductEntity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(item.quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(now))
                .filter(product::Column::Id.eq(item.product_id))
                .filter(product::Column::Stock.gte(item.quantity))
                .exec(&txn)
                .await?;

            if decremented.rows_affected == 0 {
                warn!(
                    product_id = %item.product_id,
                    quantity = item.quantity,
                    "stock shortfall at commit, clamping to zero"
                );
                ProductEntity::update_many()
                    .col_expr(product::Column::Stock, Expr::value(0))
                    .col_expr(product::Column::UpdatedAt, Expr::value(now))
                    .filter(product::Column::Id.eq(item.product_id))
                    .exec(&txn)
                    .await?;
                shortfalls.push(item.product_id);
                short_names.push(item.name.clone());
            }
        }

        if !shortfalls.is_empty() {
            let order = OrderEntity::find_by_id(order_id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;
            let history = order.history_with(StatusHistoryEntry::now(
                &order.status,
                format!("Stock shortfall for: {}", short_names.join(", ")),
            ));
            OrderEntity::update_many()
                .col_expr(order::Column::StatusHistory, Expr::value(history))
                .filter(order::Column::Id.eq(order_id))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;

        info!(lines = items.len(), shortfalls = shortfalls.len(), "stock committed");
        self.event_sender
            .send_or_log(Event::StockCommitted {
                order_id,
                shortfalls: shortfalls.clone(),
            })
            .await;

        Ok(StockCommit::Committed { shortfalls })
    }
}
