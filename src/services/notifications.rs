use crate::{errors::ServiceError, services::orders::PopulatedOrder};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Delivers order confirmations to customers.
///
/// Delivery is best effort: callers log failures and carry on.
#[async_trait]
pub trait OrderNotifier: Send + Sync {
    async fn send_order_confirmation(&self, order: &PopulatedOrder) -> Result<(), ServiceError>;
}

/// Writes confirmations to the log. Used when no relay is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl OrderNotifier for LogNotifier {
    async fn send_order_confirmation(&self, order: &PopulatedOrder) -> Result<(), ServiceError> {
        info!(
            order_number = %order.order.order_id,
            email = %order.customer.email,
            final_amount = %order.order.final_amount,
            "order confirmation"
        );
        Ok(())
    }
}

/// POSTs the populated order as JSON to a mail relay
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    max_retries: u32,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServiceError::ExternalServiceError(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            max_retries: 3,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }
}

#[async_trait]
impl OrderNotifier for WebhookNotifier {
    #[instrument(skip(self, order), fields(order_number = %order.order.order_id))]
    async fn send_order_confirmation(&self, order: &PopulatedOrder) -> Result<(), ServiceError> {
        for attempt in 1..=self.max_retries {
            match self.client.post(&self.url).json(order).send().await {
                Ok(response) if response.status().is_success() => {
                    info!("order confirmation delivered");
                    return Ok(());
                }
                Ok(response) => warn!(
                    status = %response.status(),
                    attempt,
                    max_retries = self.max_retries,
                    "order confirmation rejected by relay"
                ),
                Err(e) => warn!(
                    error = %e,
                    attempt,
                    max_retries = self.max_retries,
                    "order confirmation delivery error"
                ),
            }

            if attempt < self.max_retries {
                tokio::time::sleep(Duration::from_millis(250 * 2_u64.pow(attempt - 1))).await;
            }
        }

        Err(ServiceError::ExternalServiceError(format!(
            "Failed to deliver order confirmation after {} attempts",
            self.max_retries
        )))
    }
}
