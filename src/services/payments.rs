use crate::{
    config::AppConfig,
    db::DbPool,
    entities::order::{self, Entity as OrderEntity, StatusHistoryEntry},
    errors::ServiceError,
    events::{Event, EventSender},
};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Order opened on the payment gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub receipt: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a gateway order for `amount_minor` (paise for INR).
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, ServiceError>;

    /// Checks the checkout signature returned to the client after payment.
    fn verify_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool;
}

/// Hex HMAC-SHA256 of `order_id|payment_id` keyed with the gateway secret
pub fn payment_signature(secret: &str, order_id: &str, payment_id: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{}|{}", order_id, payment_id).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn signature_matches(secret: &str, order_id: &str, payment_id: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("{}|{}", order_id, payment_id).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Serialize)]
struct CreateOrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: GatewayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    description: Option<String>,
    reason: Option<String>,
    field: Option<String>,
}

/// Razorpay Orders API client
#[derive(Clone)]
pub struct RazorpayClient {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl std::fmt::Debug for RazorpayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RazorpayClient")
            .field("base_url", &self.base_url)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl RazorpayClient {
    pub fn new(
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ServiceError::ExternalServiceError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key_id: key_id.into(),
            key_secret: key_secret.into(),
        })
    }

    /// Builds the client when both Razorpay keys are configured.
    pub fn from_config(config: &AppConfig) -> Result<Option<Self>, ServiceError> {
        match config.razorpay_credentials() {
            Some((key_id, key_secret)) => {
                Self::new(key_id, key_secret, config.razorpay_api_base.as_str()).map(Some)
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    #[instrument(skip(self))]
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, ServiceError> {
        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&CreateOrderBody {
                amount: amount_minor,
                currency,
                receipt,
            })
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "payment gateway unreachable");
                ServiceError::payment_gateway(format!("Failed to reach payment gateway: {}", e))
            })?;

        let status = response.status();
        if status.is_success() {
            let order: GatewayOrder = response.json().await.map_err(|e| {
                ServiceError::payment_gateway(format!("Unexpected gateway response: {}", e))
            })?;
            info!(gateway_order_id = %order.id, "gateway order created");
            return Ok(order);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(%status, "payment gateway rejected order");
        match serde_json::from_str::<GatewayErrorBody>(&body) {
            Ok(parsed) => Err(ServiceError::PaymentGatewayError {
                message: parsed
                    .error
                    .description
                    .unwrap_or_else(|| format!("Gateway returned {}", status)),
                reason: parsed.error.reason,
                field: parsed.error.field,
            }),
            Err(_) => Err(ServiceError::payment_gateway(format!(
                "Gateway returned {}",
                status
            ))),
        }
    }

    fn verify_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        signature_matches(&self.key_secret, order_id, payment_id, signature)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    pub razorpay_order_id: Option<String>,
    pub razorpay_payment_id: Option<String>,
    pub razorpay_signature: Option<String>,
}

/// Confirms gateway payments against stored orders
#[derive(Clone)]
pub struct PaymentService {
    db_pool: Arc<DbPool>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    event_sender: Arc<EventSender>,
}

impl PaymentService {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Option<Arc<dyn PaymentGateway>>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db_pool,
            gateway,
            event_sender,
        }
    }

    /// Marks the caller's order paid once the gateway signature checks out.
    /// Verifying an already-paid order is a no-op.
    #[instrument(skip(self, request), fields(user_id = %user_id))]
    pub async fn verify_payment(
        &self,
        user_id: Uuid,
        request: VerifyPaymentRequest,
    ) -> Result<order::Model, ServiceError> {
        let (Some(gateway_order_id), Some(payment_id), Some(signature)) = (
            request.razorpay_order_id,
            request.razorpay_payment_id,
            request.razorpay_signature,
        ) else {
            return Err(ServiceError::BadRequest(
                "Missing payment verification fields".to_string(),
            ));
        };

        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| ServiceError::payment_gateway("Payment gateway is not configured"))?;

        let order = OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .filter(order::Column::RazorpayOrderId.eq(gateway_order_id.as_str()))
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

        if order.payment_status == order::PAYMENT_STATUS_PAID {
            return Ok(order);
        }

        if !gateway.verify_signature(&gateway_order_id, &payment_id, &signature) {
            warn!(order_id = %order.id, "payment signature mismatch");
            return Err(ServiceError::BadRequest(
                "Invalid payment signature".to_string(),
            ));
        }

        let now = Utc::now();
        let history = order.history_with(StatusHistoryEntry::now(
            "payment_verified",
            format!("Payment {} verified", payment_id),
        ));
        let order_id = order.id;

        let mut active: order::ActiveModel = order.into();
        active.payment_status = Set(order::PAYMENT_STATUS_PAID.to_string());
        active.razorpay_payment_id = Set(Some(payment_id.clone()));
        active.paid_at = Set(Some(now));
        active.status_history = Set(history);
        active.updated_at = Set(now);
        let updated = active.update(&*self.db_pool).await?;

        info!(%order_id, "payment verified");
        self.event_sender
            .send_or_log(Event::PaymentVerified {
                order_id,
                payment_id,
                paid_at: now,
            })
            .await;

        Ok(updated)
    }
}
