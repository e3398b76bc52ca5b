#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::{json, Value};
use storefront_api::{
    auth::{AuthConfig, AuthService},
    config::AppConfig,
    db,
    entities::{product, referral, user, Product, User},
    events::{self, EventSender},
    handlers::AppServices,
    services::{
        notifications::{LogNotifier, OrderNotifier},
        orders::{OrderItemInput, PlaceOrderRequest},
        payments::PaymentGateway,
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";

/// Application state over a fresh in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub auth: Arc<AuthService>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_collaborators(None, Arc::new(LogNotifier)).await
    }

    pub async fn with_gateway(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self::with_collaborators(Some(gateway), Arc::new(LogNotifier)).await
    }

    pub async fn with_collaborators(
        gateway: Option<Arc<dyn PaymentGateway>>,
        notifier: Arc<dyn OrderNotifier>,
    ) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            TEST_JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.auto_migrate = true;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let auth = Arc::new(AuthService::new(AuthConfig::new(
            cfg.jwt_secret.clone(),
            Duration::from_secs(cfg.jwt_expiration as u64),
        )));

        let services = AppServices::new(
            db_arc.clone(),
            event_sender.clone(),
            gateway,
            notifier,
            cfg.payment_currency.clone(),
        );

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
            auth: auth.clone(),
        };

        Self {
            router: storefront_api::build_router(state.clone()),
            state,
            auth,
            _event_task: event_task,
        }
    }

    pub fn token_for(&self, user_id: Uuid) -> String {
        self.auth
            .issue_token(user_id, None)
            .expect("issue test token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn seed_user(&self, name: &str, coins: i64, referred_by: Option<Uuid>) -> user::Model {
        let now = Utc::now();
        user::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            email: Set(format!("{}-{}@example.com", name.to_lowercase(), Uuid::new_v4())),
            coins: Set(coins),
            total_earned: Set(0),
            total_redeemed: Set(0),
            referred_by: Set(referred_by),
            referral_total_earnings: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed user")
    }

    pub async fn seed_product(
        &self,
        name: &str,
        description: &str,
        price: Decimal,
        stock: i32,
        is_gift: bool,
    ) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            description: Set(description.to_string()),
            category: Set(if is_gift { "accessories" } else { "electronics" }.to_string()),
            price: Set(price),
            stock: Set(stock),
            is_gift: Set(is_gift),
            images: Set(json!([format!("https://cdn.example.com/{}.jpg", Uuid::new_v4())])),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_referral(&self, referrer_id: Uuid, referred_id: Uuid) -> referral::Model {
        let now = Utc::now();
        referral::ActiveModel {
            id: Set(Uuid::new_v4()),
            referrer_id: Set(referrer_id),
            referred_id: Set(referred_id),
            status: Set(referral::STATUS_PENDING.to_string()),
            first_order_completed: Set(false),
            first_order_date: Set(None),
            order_reward: Set(0),
            total_rewards: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed referral")
    }

    pub async fn user(&self, id: Uuid) -> user::Model {
        User::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load user")
            .expect("user exists")
    }

    pub async fn product(&self, id: Uuid) -> product::Model {
        Product::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load product")
            .expect("product exists")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

/// Single-line checkout for `product`.
pub fn checkout_for(
    product: &product::Model,
    items_price: Decimal,
    tax_price: Decimal,
    payment_method: &str,
) -> PlaceOrderRequest {
    PlaceOrderRequest {
        order_items: Some(vec![OrderItemInput {
            id: Some(product.id),
            name: Some(product.name.clone()),
            quantity: Some(1),
            price: Some(product.price),
            image: product.primary_image(),
        }]),
        shipping_address: Some(json!({
            "address": "12 MG Road",
            "city": "Pune",
            "postalCode": "411001",
            "country": "India"
        })),
        payment_method: Some(payment_method.to_string()),
        items_price: Some(items_price),
        tax_price: Some(tax_price),
        total_price: Some(items_price + tax_price),
        coin_discount: None,
        coins_used: None,
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
