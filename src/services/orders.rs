/*!
 * # Order placement
 *
 * Checkout runs in three phases:
 *
 * 1. Validation: request shape, coin redemption and advisory stock checks,
 *    plus the payment-gateway order for online payments. Nothing is written.
 * 2. Persistence: the order, its line items and the gift evaluation commit in
 *    one transaction.
 * 3. Settlement: coin redemption, purchase reward, referral bonus, stock
 *    decrement and the confirmation. Every step is keyed by the order and
 *    safe to run again, so `reconcile` can finish an order whose settlement
 *    was interrupted.
 */

use crate::{
    db::DbPool,
    entities::{
        order::{self, Entity as OrderEntity, StatusHistoryEntry},
        order_item::{self, Entity as OrderItemEntity},
        product::{self, Entity as ProductEntity},
        user::{self, Entity as UserEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    metrics,
    services::{
        coins::{self, CoinLedgerService, LedgerOutcome},
        gifts::{self, GiftItemSnapshot, IssuedGift},
        inventory::{InventoryService, StockCommit, StockRequest},
        notifications::OrderNotifier,
        payments::PaymentGateway,
        referrals::ReferralService,
    },
};
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn, Instrument};
use utoipa::ToSchema;
use uuid::Uuid;

pub const STATUS_PLACED: &str = "placed";

const ORDER_NUMBER_ATTEMPTS: usize = 5;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentMethod {
    Cod,
    Razorpay,
}

/// Cart line as submitted by the client
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemInput {
    /// Product id
    pub id: Option<Uuid>,
    pub name: Option<String>,
    pub quantity: Option<i32>,
    pub price: Option<Decimal>,
    pub image: Option<String>,
}

/// Checkout request body. Every field is optional on the wire so that a
/// missing field is reported as a bad request rather than a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub order_items: Option<Vec<OrderItemInput>>,
    #[schema(value_type = Option<Object>)]
    pub shipping_address: Option<serde_json::Value>,
    pub payment_method: Option<String>,
    pub items_price: Option<Decimal>,
    pub tax_price: Option<Decimal>,
    pub total_price: Option<Decimal>,
    pub coin_discount: Option<Decimal>,
    pub coins_used: Option<i64>,
}

/// A validated cart line
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutLine {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub price: Decimal,
    pub image: Option<String>,
}

/// A checkout request with every required field present
#[derive(Debug, Clone, PartialEq)]
pub struct Checkout {
    pub lines: Vec<CheckoutLine>,
    pub shipping_address: serde_json::Value,
    pub payment_method: PaymentMethod,
    pub items_price: Decimal,
    pub tax_price: Decimal,
    pub total_price: Decimal,
    pub coin_discount: Decimal,
    pub coins_used: i64,
}

impl Checkout {
    pub fn final_amount(&self) -> Decimal {
        self.total_price - self.coin_discount
    }

    fn stock_requests(&self) -> Vec<StockRequest> {
        self.lines
            .iter()
            .map(|line| StockRequest {
                product_id: line.product_id,
                name: line.name.clone(),
                quantity: line.quantity,
            })
            .collect()
    }

    /// Product id to name, in cart order
    fn product_names(&self) -> Vec<(Uuid, String)> {
        self.lines
            .iter()
            .map(|line| (line.product_id, line.name.clone()))
            .collect()
    }
}

impl TryFrom<PlaceOrderRequest> for Checkout {
    type Error = ServiceError;

    fn try_from(request: PlaceOrderRequest) -> Result<Self, Self::Error> {
        let items = match request.order_items {
            Some(items) if !items.is_empty() => items,
            _ => return Err(ServiceError::BadRequest("No order items".to_string())),
        };

        let shipping_address = request.shipping_address.filter(|v| !v.is_null());
        let mut missing = Vec::new();
        if shipping_address.is_none() {
            missing.push("shippingAddress");
        }
        if request.payment_method.is_none() {
            missing.push("paymentMethod");
        }
        if request.items_price.is_none() {
            missing.push("itemsPrice");
        }
        if request.tax_price.is_none() {
            missing.push("taxPrice");
        }
        if request.total_price.is_none() {
            missing.push("totalPrice");
        }
        let (
            Some(shipping_address),
            Some(payment_method),
            Some(items_price),
            Some(tax_price),
            Some(total_price),
        ) = (
            shipping_address,
            request.payment_method,
            request.items_price,
            request.tax_price,
            request.total_price,
        )
        else {
            return Err(ServiceError::BadRequest(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        };

        let payment_method = PaymentMethod::from_str(&payment_method).map_err(|_| {
            ServiceError::BadRequest(format!("Invalid payment method: {}", payment_method))
        })?;

        if [items_price, tax_price, total_price]
            .iter()
            .any(|amount| *amount < Decimal::ZERO)
        {
            return Err(ServiceError::BadRequest(
                "Prices cannot be negative".to_string(),
            ));
        }

        let lines = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match (item.id, item.name, item.quantity, item.price) {
                (Some(product_id), Some(name), Some(quantity), Some(price))
                    if quantity > 0 && price >= Decimal::ZERO =>
                {
                    Ok(CheckoutLine {
                        product_id,
                        name,
                        quantity,
                        price,
                        image: item.image,
                    })
                }
                _ => Err(ServiceError::BadRequest(format!(
                    "Invalid order item at position {}",
                    index
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Checkout {
            lines,
            shipping_address,
            payment_method,
            items_price,
            tax_price,
            total_price,
            coin_discount: request.coin_discount.unwrap_or(Decimal::ZERO),
            coins_used: request.coins_used.unwrap_or(0),
        })
    }
}

/// `ORD-YYYYMMDD-XXXXXX` with an uppercase alphanumeric suffix
pub fn generate_order_number(at: DateTime<Utc>) -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect();
    format!("ORD-{}-{}", at.format("%Y%m%d"), suffix)
}

/// Draws order numbers from `candidates` until one is not already stored.
pub async fn unused_order_number<C, I>(conn: &C, candidates: I) -> Result<String, ServiceError>
where
    C: ConnectionTrait,
    I: IntoIterator<Item = String>,
{
    for number in candidates.into_iter().take(ORDER_NUMBER_ATTEMPTS) {
        let taken = OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(number.as_str()))
            .one(conn)
            .await?
            .is_some();
        if !taken {
            return Ok(number);
        }
        debug!(order_number = %number, "order number collision, retrying");
    }
    Err(ServiceError::InternalError(
        "Could not generate a unique order number".to_string(),
    ))
}

/// Amount in minor currency units (paise for INR)
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemView {
    pub product: Uuid,
    /// Current catalog name of the product
    pub product_name: String,
    pub name: String,
    pub quantity: i32,
    pub price: Decimal,
    pub image: Option<String>,
    pub is_gift: bool,
    pub gift_coupon_code: Option<String>,
    pub value: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub id: Uuid,
    /// Human-readable order id
    pub order_id: String,
    pub user: Uuid,
    pub order_items: Vec<OrderItemView>,
    #[schema(value_type = Object)]
    pub shipping_address: serde_json::Value,
    pub payment_method: String,
    pub items_price: Decimal,
    pub tax_price: Decimal,
    pub total_price: Decimal,
    pub coin_discount: Decimal,
    pub coins_used: i64,
    pub final_amount: Decimal,
    pub razorpay_order_id: Option<String>,
    pub payment_status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub status: String,
    pub status_history: Vec<StatusHistoryEntry>,
    pub settled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderView {
    fn build(
        order: order::Model,
        items: Vec<order_item::Model>,
        product_names: &HashMap<Uuid, String>,
    ) -> Self {
        let status_history = order.history();
        let order_items = items
            .into_iter()
            .map(|item| OrderItemView {
                product: item.product_id,
                product_name: product_names
                    .get(&item.product_id)
                    .cloned()
                    .unwrap_or_else(|| item.name.clone()),
                name: item.name,
                quantity: item.quantity,
                price: item.price,
                image: item.image,
                is_gift: item.is_gift,
                gift_coupon_code: item.gift_coupon_code,
                value: item.value,
            })
            .collect();

        Self {
            id: order.id,
            order_id: order.order_number,
            user: order.user_id,
            order_items,
            shipping_address: order.shipping_address,
            payment_method: order.payment_method,
            items_price: order.items_price,
            tax_price: order.tax_price,
            total_price: order.total_price,
            coin_discount: order.coin_discount,
            coins_used: order.coins_used,
            final_amount: order.final_amount,
            razorpay_order_id: order.razorpay_order_id,
            payment_status: order.payment_status,
            paid_at: order.paid_at,
            status: order.status,
            status_history,
            settled: order.settled,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// Loads line items and product names for `orders`, keeping their order.
pub async fn load_order_views<C: ConnectionTrait>(
    conn: &C,
    orders: Vec<order::Model>,
) -> Result<Vec<OrderView>, ServiceError> {
    if orders.is_empty() {
        return Ok(Vec::new());
    }

    let order_ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
    let items = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.is_in(order_ids))
        .order_by_asc(order_item::Column::Position)
        .all(conn)
        .await?;

    let mut product_ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
    product_ids.sort();
    product_ids.dedup();
    let product_names: HashMap<Uuid, String> = ProductEntity::find()
        .filter(product::Column::Id.is_in(product_ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|p| (p.id, p.name))
        .collect();

    let mut items_by_order: HashMap<Uuid, Vec<order_item::Model>> = HashMap::new();
    for item in items {
        items_by_order.entry(item.order_id).or_default().push(item);
    }

    Ok(orders
        .into_iter()
        .map(|order| {
            let items = items_by_order.remove(&order.id).unwrap_or_default();
            OrderView::build(order, items, &product_names)
        })
        .collect())
}

async fn load_order_view<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
) -> Result<OrderView, ServiceError> {
    load_order_views(conn, vec![order])
        .await?
        .pop()
        .ok_or_else(|| ServiceError::InternalError("Order view could not be built".to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSummary {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

impl From<&user::Model> for CustomerSummary {
    fn from(user: &user::Model) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
        }
    }
}

/// Order with its customer, handed to the notifier
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PopulatedOrder {
    pub order: OrderView,
    pub customer: CustomerSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GiftCouponSummary {
    pub code: String,
    pub gift_item: GiftItemSnapshot,
    pub valid_until: DateTime<Utc>,
    pub product_id: Uuid,
}

impl From<&IssuedGift> for GiftCouponSummary {
    fn from(gift: &IssuedGift) -> Self {
        Self {
            code: gift.coupon.code.clone(),
            gift_item: GiftItemSnapshot::from(&gift.gift_product),
            valid_until: gift.coupon.valid_until,
            product_id: gift.gift_product.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderResponse {
    pub order: OrderView,
    pub razorpay_order_id: Option<String>,
    pub coins_earned: i64,
    pub gift_coupon: Option<GiftCouponSummary>,
}

/// What one settlement pass applied
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReport {
    pub coins_redeemed: i64,
    pub coins_earned: i64,
    pub referral_bonus_credited: bool,
    pub stock_shortfalls: Vec<Uuid>,
    /// A confirmation was handed to the notifier in the background
    pub confirmation_dispatched: bool,
    /// Steps that failed and will be retried by reconciliation
    pub failures: Vec<String>,
    pub settled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub examined: usize,
    pub settled: usize,
}

async fn send_confirmation(
    db: &DbPool,
    notifier: &dyn OrderNotifier,
    order_id: Uuid,
) -> Result<(), ServiceError> {
    let order = OrderEntity::find_by_id(order_id)
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;
    let customer = UserEntity::find_by_id(order.user_id)
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

    let populated = PopulatedOrder {
        order: load_order_view(db, order).await?,
        customer: CustomerSummary::from(&customer),
    };
    notifier.send_order_confirmation(&populated).await?;

    OrderEntity::update_many()
        .col_expr(order::Column::ConfirmationSent, Expr::value(true))
        .filter(order::Column::Id.eq(order_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Coordinates checkout and post-placement settlement
#[derive(Clone)]
pub struct OrderPlacementService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    coins: Arc<CoinLedgerService>,
    referrals: Arc<ReferralService>,
    inventory: Arc<InventoryService>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    notifier: Arc<dyn OrderNotifier>,
    currency: String,
    confirmations: Arc<Mutex<JoinSet<()>>>,
}

impl OrderPlacementService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        gateway: Option<Arc<dyn PaymentGateway>>,
        notifier: Arc<dyn OrderNotifier>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            coins: Arc::new(CoinLedgerService::new(db_pool.clone(), event_sender.clone())),
            referrals: Arc::new(ReferralService::new(db_pool.clone(), event_sender.clone())),
            inventory: Arc::new(InventoryService::new(db_pool.clone(), event_sender.clone())),
            db_pool,
            event_sender,
            gateway,
            notifier,
            currency: currency.into(),
            confirmations: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub fn coins(&self) -> Arc<CoinLedgerService> {
        self.coins.clone()
    }

    pub fn gateway(&self) -> Option<Arc<dyn PaymentGateway>> {
        self.gateway.clone()
    }

    /// Places an order for `user_id`.
    ///
    /// Validation failures persist nothing. Once the order is stored the call
    /// succeeds even if part of settlement fails; those orders stay unsettled
    /// for `reconcile`.
    #[instrument(skip(self, request), fields(user_id = %user_id))]
    pub async fn place_order(
        &self,
        user_id: Uuid,
        request: PlaceOrderRequest,
    ) -> Result<PlaceOrderResponse, ServiceError> {
        let result = self.try_place_order(user_id, request).await;
        if let Err(e) = &result {
            metrics::ORDER_PLACEMENT_FAILURES
                .with_label_values(&[e.kind()])
                .inc();
            warn!(error = %e, kind = e.kind(), "order placement rejected");
        }
        result
    }

    async fn try_place_order(
        &self,
        user_id: Uuid,
        request: PlaceOrderRequest,
    ) -> Result<PlaceOrderResponse, ServiceError> {
        let checkout = Checkout::try_from(request)?;
        let db = &*self.db_pool;

        let user = UserEntity::find_by_id(user_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

        coins::check_redemption(
            user.coins,
            checkout.coins_used,
            checkout.coin_discount,
            checkout.total_price,
        )?;

        self.inventory
            .validate_stock(&checkout.stock_requests())
            .await?;

        let final_amount = checkout.final_amount();
        let order_number = unused_order_number(
            db,
            std::iter::repeat_with(|| generate_order_number(Utc::now())),
        )
        .await?;

        let razorpay_order_id = match checkout.payment_method {
            PaymentMethod::Razorpay => {
                Some(self.open_gateway_order(final_amount, &order_number).await?)
            }
            PaymentMethod::Cod => None,
        };

        let (order, gift) = self
            .persist_order(&user, &checkout, &order_number, final_amount, razorpay_order_id.clone())
            .await?;

        let payment_method = checkout.payment_method.to_string();
        metrics::ORDERS_PLACED
            .with_label_values(&[payment_method.as_str()])
            .inc();
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            %final_amount,
            gift_issued = gift.is_some(),
            "order placed"
        );
        self.event_sender
            .send_or_log(Event::OrderPlaced {
                order_id: order.id,
                order_number: order.order_number.clone(),
                user_id,
                final_amount,
                payment_method,
            })
            .await;
        if let Some(issued) = &gift {
            let category = issued.category.to_string();
            metrics::GIFT_COUPONS_ISSUED
                .with_label_values(&[category.as_str()])
                .inc();
            self.event_sender
                .send_or_log(Event::GiftCouponIssued {
                    order_id: order.id,
                    coupon_code: issued.coupon.code.clone(),
                    gift_product_id: issued.gift_product.id,
                    category,
                })
                .await;
        }

        let order_id = order.id;
        self.settle(&order).await;

        let stored = OrderEntity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::InternalError("Placed order disappeared".to_string()))?;

        Ok(PlaceOrderResponse {
            order: load_order_view(db, stored).await?,
            razorpay_order_id,
            coins_earned: coins::purchase_reward_for(final_amount),
            gift_coupon: gift.as_ref().map(GiftCouponSummary::from),
        })
    }

    async fn open_gateway_order(
        &self,
        final_amount: Decimal,
        receipt: &str,
    ) -> Result<String, ServiceError> {
        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| ServiceError::payment_gateway("Payment gateway is not configured"))?;

        let amount_minor = to_minor_units(final_amount)
            .ok_or_else(|| ServiceError::BadRequest("Order amount out of range".to_string()))?;

        let gateway_order = gateway
            .create_order(amount_minor, &self.currency, receipt)
            .await
            .map_err(|e| {
                error!(error = %e, amount_minor, "failed to open gateway order");
                e
            })?;
        Ok(gateway_order.id)
    }

    /// Writes the order, its lines and the gift evaluation in one transaction.
    async fn persist_order(
        &self,
        user: &user::Model,
        checkout: &Checkout,
        order_number: &str,
        final_amount: Decimal,
        razorpay_order_id: Option<String>,
    ) -> Result<(order::Model, Option<IssuedGift>), ServiceError> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let payment_status = match checkout.payment_method {
            PaymentMethod::Cod => order::PAYMENT_STATUS_COD,
            PaymentMethod::Razorpay => order::PAYMENT_STATUS_PENDING,
        };
        let history = serde_json::to_value(vec![StatusHistoryEntry::now(
            STATUS_PLACED,
            "Order placed successfully",
        )])?;

        let txn = self.db_pool.begin().await?;

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.to_string()),
            user_id: Set(user.id),
            shipping_address: Set(checkout.shipping_address.clone()),
            payment_method: Set(checkout.payment_method.to_string()),
            items_price: Set(checkout.items_price),
            tax_price: Set(checkout.tax_price),
            total_price: Set(checkout.total_price),
            coin_discount: Set(checkout.coin_discount),
            coins_used: Set(checkout.coins_used),
            final_amount: Set(final_amount),
            razorpay_order_id: Set(razorpay_order_id),
            razorpay_payment_id: Set(None),
            payment_status: Set(payment_status.to_string()),
            paid_at: Set(None),
            status: Set(STATUS_PLACED.to_string()),
            status_history: Set(history),
            gift_evaluated: Set(false),
            stock_committed: Set(false),
            confirmation_sent: Set(false),
            settled: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, %order_id, "failed to insert order");
            ServiceError::DatabaseError(e)
        })?;

        for (position, line) in checkout.lines.iter().enumerate() {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                position: Set(position as i32),
                name: Set(line.name.clone()),
                quantity: Set(line.quantity),
                price: Set(line.price),
                image: Set(line.image.clone()),
                is_gift: Set(false),
                gift_coupon_code: Set(None),
                value: Set(None),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        let gift = self
            .evaluate_gift(
                &txn,
                user.id,
                order_id,
                &checkout.product_names(),
                checkout.lines.len(),
            )
            .await;

        OrderEntity::update_many()
            .col_expr(order::Column::GiftEvaluated, Expr::value(true))
            .filter(order::Column::Id.eq(order_id))
            .exec(&txn)
            .await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, %order_id, "failed to commit order");
            ServiceError::DatabaseError(e)
        })?;

        Ok((order, gift))
    }

    /// Runs the gift engine inside a savepoint. Any failure is logged and
    /// rolls back only the gift.
    async fn evaluate_gift(
        &self,
        txn: &DatabaseTransaction,
        user_id: Uuid,
        order_id: Uuid,
        product_names: &[(Uuid, String)],
        position: usize,
    ) -> Option<IssuedGift> {
        let savepoint = match txn.begin().await {
            Ok(sp) => sp,
            Err(e) => {
                warn!(error = %e, %order_id, "could not open gift savepoint");
                return None;
            }
        };

        let issued = match gifts::create_gift_coupon(&savepoint, user_id, order_id, product_names)
            .await
        {
            Ok(Some(issued)) => issued,
            Ok(None) => {
                let _ = savepoint.rollback().await;
                return None;
            }
            Err(e) => {
                warn!(error = %e, %order_id, "gift coupon creation failed");
                let _ = savepoint.rollback().await;
                return None;
            }
        };

        let gift_line = order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            product_id: Set(issued.gift_product.id),
            position: Set(position as i32),
            name: Set(issued.gift_product.name.clone()),
            quantity: Set(1),
            price: Set(Decimal::ZERO),
            image: Set(issued.gift_product.primary_image()),
            is_gift: Set(true),
            gift_coupon_code: Set(Some(issued.coupon.code.clone())),
            value: Set(Some(issued.gift_product.price)),
            created_at: Set(Utc::now()),
        };
        if let Err(e) = gift_line.insert(&savepoint).await {
            warn!(error = %e, %order_id, "failed to attach gift line");
            let _ = savepoint.rollback().await;
            return None;
        }

        match savepoint.commit().await {
            Ok(()) => Some(issued),
            Err(e) => {
                warn!(error = %e, %order_id, "failed to release gift savepoint");
                None
            }
        }
    }

    fn record_failure(report: &mut SettlementReport, order_id: Uuid, step: &str, err: &ServiceError) {
        metrics::SETTLEMENT_FAILURES.with_label_values(&[step]).inc();
        error!(%order_id, step, error = %err, "settlement step failed");
        report.failures.push(step.to_string());
    }

    /// Applies every post-placement side effect that has not happened yet.
    #[instrument(skip(self, order), fields(order_id = %order.id, order_number = %order.order_number))]
    async fn settle(&self, order: &order::Model) -> SettlementReport {
        let mut report = SettlementReport::default();

        match self
            .coins
            .redeem_for_order(order.user_id, order.id, &order.order_number, order.coins_used)
            .await
        {
            Ok(LedgerOutcome::Applied(tx)) => report.coins_redeemed = tx.amount,
            Ok(_) => {}
            Err(e) => Self::record_failure(&mut report, order.id, "coin_redemption", &e),
        }

        let reward = coins::purchase_reward_for(order.final_amount);
        match self
            .coins
            .award_for_order(order.user_id, order.id, &order.order_number, reward)
            .await
        {
            Ok(LedgerOutcome::Applied(tx)) => report.coins_earned = tx.amount,
            Ok(_) => {}
            Err(e) => Self::record_failure(&mut report, order.id, "coin_reward", &e),
        }

        let purchaser = UserEntity::find_by_id(order.user_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::from)
            .and_then(|u| u.ok_or_else(|| ServiceError::NotFound("User not found".to_string())));
        match purchaser {
            Ok(purchaser) => match self.referrals.credit_first_order(&purchaser, order.id).await {
                Ok(credit) => report.referral_bonus_credited = credit.is_some(),
                Err(e) => Self::record_failure(&mut report, order.id, "referral_bonus", &e),
            },
            Err(e) => Self::record_failure(&mut report, order.id, "referral_bonus", &e),
        }

        match self.inventory.commit_stock(order.id).await {
            Ok(StockCommit::Committed { shortfalls }) => report.stock_shortfalls = shortfalls,
            Ok(StockCommit::AlreadyCommitted) => {}
            Err(e) => Self::record_failure(&mut report, order.id, "stock_commit", &e),
        }

        if !order.confirmation_sent {
            self.dispatch_confirmation(order.id);
            report.confirmation_dispatched = true;
        }

        if !report.failures.is_empty() {
            error!(failures = ?report.failures, "order settlement incomplete");
            return report;
        }

        match OrderEntity::update_many()
            .col_expr(order::Column::Settled, Expr::value(true))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order.id))
            .exec(&*self.db_pool)
            .await
        {
            Ok(_) => report.settled = true,
            Err(e) => {
                Self::record_failure(&mut report, order.id, "mark_settled", &ServiceError::from(e))
            }
        }

        report
    }

    /// Sends the confirmation off the request path. Failures are logged and
    /// leave `confirmation_sent` false for the next settlement pass.
    fn dispatch_confirmation(&self, order_id: Uuid) {
        let db_pool = self.db_pool.clone();
        let notifier = self.notifier.clone();
        let mut tasks = self
            .confirmations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.spawn(
            async move {
                match send_confirmation(&db_pool, notifier.as_ref(), order_id).await {
                    Ok(()) => info!("order confirmation sent"),
                    Err(e) => warn!(error = %e, "order confirmation not sent"),
                }
            }
            .in_current_span(),
        );
    }

    /// Waits for every confirmation dispatched so far to finish.
    pub async fn wait_for_confirmations(&self) {
        let mut tasks = std::mem::take(
            &mut *self
                .confirmations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        while tasks.join_next().await.is_some() {}
    }

    /// Re-drives settlement for a stored order.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, order_number: &str) -> Result<SettlementReport, ServiceError> {
        let order = OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

        if order.settled {
            return Ok(SettlementReport {
                settled: true,
                ..SettlementReport::default()
            });
        }

        Ok(self.settle(&order).await)
    }

    /// Settles up to `limit` unsettled orders, oldest first.
    #[instrument(skip(self))]
    pub async fn reconcile_pending(&self, limit: u64) -> Result<ReconcileSummary, ServiceError> {
        let pending = OrderEntity::find()
            .filter(order::Column::Settled.eq(false))
            .order_by_asc(order::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db_pool)
            .await?;

        let mut summary = ReconcileSummary {
            examined: pending.len(),
            settled: 0,
        };
        for order in &pending {
            if self.settle(order).await.settled {
                summary.settled += 1;
            }
        }

        info!(examined = summary.examined, settled = summary.settled, "reconciliation pass finished");
        Ok(summary)
    }

    /// The user's orders, newest first.
    pub async fn list_user_orders(&self, user_id: Uuid) -> Result<Vec<OrderView>, ServiceError> {
        let orders = OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?;
        load_order_views(&*self.db_pool, orders).await
    }

    pub async fn get_user_order(
        &self,
        user_id: Uuid,
        order_number: &str,
    ) -> Result<OrderView, ServiceError> {
        let order = OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;
        load_order_view(&*self.db_pool, order).await
    }
}
