/*!
 * Gift selection for qualifying orders.
 *
 * Orders that contain a laptop or an iPhone earn a coupon for one low-cost
 * accessory picked at random from the gift inventory. Classification is a
 * keyword match over the product's name and description.
 */

use crate::{
    db::DbPool,
    entities::{
        coupon::{self, Entity as CouponEntity},
        order::Entity as OrderEntity,
        order_item::{self, Entity as OrderItemEntity},
        product::{self, Entity as ProductEntity},
    },
    errors::ServiceError,
};
use chrono::{DateTime, Duration, Utc};
use rand::{distributions::Alphanumeric, seq::SliceRandom, thread_rng, Rng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

pub const COUPON_PREFIX: &str = "GIFT";
pub const COUPON_SUFFIX_LEN: usize = 6;
pub const COUPON_VALIDITY_DAYS: i64 = 30;
/// Most expensive product that may be handed out as a gift
pub const GIFT_PRICE_CEILING: Decimal = dec!(400);

const CODE_ATTEMPTS: usize = 5;

const LAPTOP_KEYWORDS: &[&str] = &[
    "laptop",
    "notebook",
    "macbook",
    "thinkpad",
    "chromebook",
    "portable computer",
];
const IPHONE_KEYWORDS: &[&str] = &["iphone", "i phone", "apple phone"];

const LAPTOP_GIFT_KEYWORDS: &[&str] = &["mouse", "keyboard", "cleaner"];
const IPHONE_GIFT_KEYWORDS: &[&str] = &["tempered glass", "tappan glass", "back cover"];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum GiftCategory {
    Laptop,
    Iphone,
    Accessories,
}

impl GiftCategory {
    pub fn is_gift_eligible(self) -> bool {
        matches!(self, GiftCategory::Laptop | GiftCategory::Iphone)
    }

    /// Keywords a gift product must mention to pair with this category
    pub fn gift_keywords(self) -> &'static [&'static str] {
        match self {
            GiftCategory::Laptop => LAPTOP_GIFT_KEYWORDS,
            GiftCategory::Iphone => IPHONE_GIFT_KEYWORDS,
            GiftCategory::Accessories => &[],
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Classifies a product by case-insensitive keyword search over its name and
/// description. Laptop keywords take precedence over iPhone keywords.
pub fn determine_product_category(name: &str, description: &str) -> Option<GiftCategory> {
    let text = format!("{} {}", name, description).to_lowercase();

    if contains_any(&text, LAPTOP_KEYWORDS) {
        Some(GiftCategory::Laptop)
    } else if contains_any(&text, IPHONE_KEYWORDS) {
        Some(GiftCategory::Iphone)
    } else {
        None
    }
}

/// True if `product` is a suitable gift for an order in `category`.
pub fn matches_gift_keywords(category: GiftCategory, product: &product::Model) -> bool {
    let text = format!("{} {}", product.name, product.description).to_lowercase();
    contains_any(&text, category.gift_keywords())
}

pub fn generate_coupon_code() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(COUPON_SUFFIX_LEN)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect();
    format!("{}{}", COUPON_PREFIX, suffix)
}

fn pick_gift(candidates: &[product::Model]) -> Option<product::Model> {
    candidates.choose(&mut thread_rng()).cloned()
}

/// Snapshot of the gift product stored on the coupon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GiftItemSnapshot {
    pub name: String,
    pub description: String,
    pub image: Option<String>,
    pub value: Decimal,
    pub category: String,
    pub product_id: Uuid,
}

impl From<&product::Model> for GiftItemSnapshot {
    fn from(product: &product::Model) -> Self {
        Self {
            name: product.name.clone(),
            description: product.description.clone(),
            image: product.primary_image(),
            value: product.price,
            category: product.category.clone(),
            product_id: product.id,
        }
    }
}

/// A coupon issued for an order, with the product it is redeemable for
#[derive(Debug, Clone)]
pub struct IssuedGift {
    pub coupon: coupon::Model,
    pub gift_product: product::Model,
    pub category: GiftCategory,
}

/// The product that qualified the order for a gift
#[derive(Debug, Clone)]
struct Qualifier {
    category: GiftCategory,
    product_id: Uuid,
    product_name: String,
}

async fn classify_order_items<C: ConnectionTrait>(
    conn: &C,
    items: &[order_item::Model],
) -> Result<Option<Qualifier>, ServiceError> {
    for item in items {
        let Some(product) = ProductEntity::find_by_id(item.product_id).one(conn).await? else {
            continue;
        };
        if let Some(category) = determine_product_category(&product.name, &product.description) {
            return Ok(Some(Qualifier {
                category,
                product_id: product.id,
                product_name: product.name,
            }));
        }
    }
    Ok(None)
}

fn classify_product_names(product_names: &[(Uuid, String)]) -> Option<Qualifier> {
    product_names.iter().find_map(|(id, name)| {
        determine_product_category(name, "").map(|category| Qualifier {
            category,
            product_id: *id,
            product_name: name.clone(),
        })
    })
}

async fn unused_coupon_code<C: ConnectionTrait>(conn: &C) -> Result<String, ServiceError> {
    for _ in 0..CODE_ATTEMPTS {
        let code = generate_coupon_code();
        let taken = CouponEntity::find()
            .filter(coupon::Column::Code.eq(code.as_str()))
            .one(conn)
            .await?
            .is_some();
        if !taken {
            return Ok(code);
        }
        debug!(code = %code, "coupon code collision, retrying");
    }
    Err(ServiceError::InternalError(
        "Could not generate a unique coupon code".to_string(),
    ))
}

/// Issues a gift coupon for `order_id` if one of its products qualifies.
///
/// `product_names` maps the checkout's product ids to names and is consulted
/// when none of the stored line items classify. Returns `Ok(None)` when the
/// order does not qualify, no gift product matches, or a coupon already exists
/// for the order.
#[instrument(skip(conn, product_names), fields(user_id = %user_id, order_id = %order_id))]
pub async fn create_gift_coupon<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    order_id: Uuid,
    product_names: &[(Uuid, String)],
) -> Result<Option<IssuedGift>, ServiceError> {
    if OrderEntity::find_by_id(order_id).one(conn).await?.is_none() {
        return Ok(None);
    }

    let items = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .filter(order_item::Column::IsGift.eq(false))
        .order_by_asc(order_item::Column::Position)
        .all(conn)
        .await?;
    if items.is_empty() {
        return Ok(None);
    }

    let existing = CouponEntity::find()
        .filter(coupon::Column::SourceOrderId.eq(order_id))
        .one(conn)
        .await?;
    if existing.is_some() {
        debug!("order already has a gift coupon");
        return Ok(None);
    }

    let qualifier = match classify_order_items(conn, &items).await? {
        Some(q) => Some(q),
        None => classify_product_names(product_names),
    };
    let Some(qualifier) = qualifier.filter(|q| q.category.is_gift_eligible()) else {
        debug!("no gift-eligible product in order");
        return Ok(None);
    };

    let candidates: Vec<product::Model> = ProductEntity::find()
        .filter(product::Column::IsGift.eq(true))
        .all(conn)
        .await?
        .into_iter()
        .filter(|p| p.price <= GIFT_PRICE_CEILING && matches_gift_keywords(qualifier.category, p))
        .collect();

    let Some(gift_product) = pick_gift(&candidates) else {
        info!(category = %qualifier.category, "no gift product available for category");
        return Ok(None);
    };

    let code = unused_coupon_code(conn).await?;
    let now = Utc::now();
    let snapshot = GiftItemSnapshot::from(&gift_product);

    let coupon = coupon::ActiveModel {
        id: Set(Uuid::new_v4()),
        code: Set(code),
        coupon_type: Set(coupon::COUPON_TYPE_GIFT.to_string()),
        gift_item: Set(serde_json::to_value(&snapshot)?),
        gift_product_id: Set(gift_product.id),
        valid_until: Set(now + Duration::days(COUPON_VALIDITY_DAYS)),
        usage_limit: Set(1),
        used_count: Set(0),
        assigned_to: Set(user_id),
        source_order_id: Set(order_id),
        is_active: Set(true),
        metadata: Set(serde_json::json!({
            "productCategory": qualifier.category.to_string(),
            "sourceProductId": qualifier.product_id,
            "sourceProductName": qualifier.product_name,
        })),
        created_at: Set(now),
    }
    .insert(conn)
    .await?;

    info!(
        coupon_code = %coupon.code,
        gift_product_id = %gift_product.id,
        category = %qualifier.category,
        "gift coupon issued"
    );

    Ok(Some(IssuedGift {
        coupon,
        gift_product,
        category: qualifier.category,
    }))
}

/// Coupon as shown to its owner
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponView {
    pub code: String,
    pub coupon_type: String,
    pub gift_item: GiftItemSnapshot,
    pub valid_until: DateTime<Utc>,
    pub usage_limit: i32,
    pub used_count: i32,
    pub is_active: bool,
    pub source_order_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<coupon::Model> for CouponView {
    type Error = ServiceError;

    fn try_from(model: coupon::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            gift_item: serde_json::from_value(model.gift_item)?,
            code: model.code,
            coupon_type: model.coupon_type,
            valid_until: model.valid_until,
            usage_limit: model.usage_limit,
            used_count: model.used_count,
            is_active: model.is_active,
            source_order_id: model.source_order_id,
            created_at: model.created_at,
        })
    }
}

/// Read access to issued gift coupons
#[derive(Clone)]
pub struct GiftCouponService {
    db_pool: Arc<DbPool>,
}

impl GiftCouponService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Coupons assigned to the user, newest first.
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<CouponView>, ServiceError> {
        CouponEntity::find()
            .filter(coupon::Column::AssignedTo.eq(user_id))
            .order_by_desc(coupon::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?
            .into_iter()
            .map(CouponView::try_from)
            .collect()
    }
}
