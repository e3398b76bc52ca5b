//! End-to-end checkout tests over an in-memory SQLite database.
//!
//! Covers coin redemption and rewards, gift coupons, referral bonuses,
//! stock commitment, gateway failures and settlement reconciliation.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use common::{checkout_for, response_json, TestApp};
use mockall::mock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{sea_query::Expr, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;
use storefront_api::{
    entities::{
        coin_transaction::{self, CoinTransactionType},
        coupon, order, product, referral, CoinTransaction, Coupon, Order, Product, Referral,
    },
    errors::ServiceError,
    services::{
        coins::SOURCE_REFERRAL_FIRST_ORDER,
        gifts,
        notifications::OrderNotifier,
        orders::{unused_order_number, PopulatedOrder},
        payments::{GatewayOrder, PaymentGateway},
    },
};

mock! {
    pub Gateway {}

    #[async_trait]
    impl PaymentGateway for Gateway {
        async fn create_order(
            &self,
            amount_minor: i64,
            currency: &str,
            receipt: &str,
        ) -> Result<GatewayOrder, ServiceError>;

        fn verify_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool;
    }
}

mock! {
    pub Notifier {}

    #[async_trait]
    impl OrderNotifier for Notifier {
        async fn send_order_confirmation(&self, order: &PopulatedOrder) -> Result<(), ServiceError>;
    }
}

async fn order_count(app: &TestApp) -> u64 {
    Order::find().count(&*app.state.db).await.unwrap()
}

async fn stored_order(app: &TestApp, id: uuid::Uuid) -> order::Model {
    Order::find_by_id(id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("order stored")
}

/// Clears `settled` so the next reconcile walks every settlement step.
async fn mark_unsettled(app: &TestApp, id: uuid::Uuid) {
    Order::update_many()
        .col_expr(order::Column::Settled, Expr::value(false))
        .filter(order::Column::Id.eq(id))
        .exec(&*app.state.db)
        .await
        .unwrap();
}

#[tokio::test]
async fn cod_order_earns_coins_and_commits_stock() {
    let app = TestApp::new().await;
    let user = app.seed_user("Asha", 0, None).await;
    let laptop = app
        .seed_product("Dell Inspiron Laptop", "15 inch laptop", dec!(50000), 5, false)
        .await;

    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, checkout_for(&laptop, dec!(50000), dec!(9000), "cod"))
        .await
        .unwrap();

    assert_eq!(placed.order.final_amount, dec!(59000));
    assert_eq!(placed.coins_earned, 590);
    assert!(placed.order.order_id.starts_with("ORD-"));
    assert_eq!(placed.order.payment_status, order::PAYMENT_STATUS_COD);
    assert_eq!(placed.order.status, "placed");
    assert!(placed.order.settled);
    assert!(placed.razorpay_order_id.is_none());

    assert_eq!(app.product(laptop.id).await.stock, 4);

    app.state.services.orders.wait_for_confirmations().await;
    assert!(stored_order(&app, placed.order.id).await.confirmation_sent);

    let buyer = app.user(user.id).await;
    assert_eq!(buyer.coins, 590);
    assert_eq!(buyer.total_earned, 590);
    assert_eq!(buyer.total_redeemed, 0);

    let earned = CoinTransaction::find()
        .filter(coin_transaction::Column::UserId.eq(user.id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(earned.len(), 1);
    assert_eq!(earned[0].transaction_type, CoinTransactionType::Earned);
    assert_eq!(earned[0].reference_id, Some(placed.order.id));
    assert_eq!(earned[0].balance_after, 590);
}

#[tokio::test]
async fn redeeming_coins_discounts_the_order() {
    let app = TestApp::new().await;
    let user = app.seed_user("Ravi", 250_000, None).await;
    let laptop = app
        .seed_product("HP Pavilion Laptop", "Laptop", dec!(50000), 3, false)
        .await;

    let mut request = checkout_for(&laptop, dec!(50000), dec!(9000), "cod");
    request.coins_used = Some(200_000);
    request.coin_discount = Some(dec!(2000));

    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, request)
        .await
        .unwrap();

    assert_eq!(placed.order.final_amount, dec!(57000));
    assert_eq!(placed.order.coins_used, 200_000);
    assert_eq!(placed.coins_earned, 570);

    let buyer = app.user(user.id).await;
    assert_eq!(buyer.coins, 50_570);
    assert_eq!(buyer.total_redeemed, 200_000);
    assert_eq!(buyer.total_earned, 570);

    let redeemed = CoinTransaction::find()
        .filter(coin_transaction::Column::UserId.eq(user.id))
        .filter(coin_transaction::Column::TransactionType.eq(CoinTransactionType::Redeemed))
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("redemption entry");
    assert_eq!(redeemed.amount, 200_000);
    assert_eq!(redeemed.balance_after, 50_000);
}

#[tokio::test]
async fn discount_above_balance_allowance_is_rejected() {
    let app = TestApp::new().await;
    let user = app.seed_user("Meera", 250_000, None).await;
    let laptop = app
        .seed_product("Acer Swift Laptop", "Laptop", dec!(50000), 3, false)
        .await;

    let mut request = checkout_for(&laptop, dec!(50000), dec!(9000), "cod");
    request.coins_used = Some(250_000);
    request.coin_discount = Some(dec!(3000));

    let err = app
        .state
        .services
        .orders
        .place_order(user.id, request)
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::InvalidDiscount(_));
    assert_eq!(order_count(&app).await, 0);
    assert_eq!(app.user(user.id).await.coins, 250_000);
    assert_eq!(app.product(laptop.id).await.stock, 3);
}

#[tokio::test]
async fn spending_more_coins_than_held_is_rejected() {
    let app = TestApp::new().await;
    let user = app.seed_user("Kiran", 1_500, None).await;
    let laptop = app
        .seed_product("Asus Vivobook Laptop", "Laptop", dec!(40000), 3, false)
        .await;

    let mut request = checkout_for(&laptop, dec!(40000), dec!(7200), "cod");
    request.coins_used = Some(200_000);
    request.coin_discount = Some(dec!(2000));

    let err = app
        .state
        .services
        .orders
        .place_order(user.id, request)
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::InsufficientCoins(_));
    assert_eq!(order_count(&app).await, 0);
}

#[tokio::test]
async fn out_of_stock_product_blocks_the_order() {
    let app = TestApp::new().await;
    let user = app.seed_user("Neha", 0, None).await;
    let phone = app
        .seed_product("iPhone 15", "Apple smartphone", dec!(70000), 0, false)
        .await;

    let err = app
        .state
        .services
        .orders
        .place_order(user.id, checkout_for(&phone, dec!(70000), dec!(12600), "cod"))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::InsufficientStock(msg) if msg == "Insufficient stock for iPhone 15");
    assert_eq!(order_count(&app).await, 0);
}

#[tokio::test]
async fn laptop_order_gets_a_gift_line_and_coupon() {
    let app = TestApp::new().await;
    let user = app.seed_user("Dev", 0, None).await;
    let laptop = app
        .seed_product("Lenovo ThinkPad E14", "Business notebook", dec!(60000), 2, false)
        .await;
    let mouse = app
        .seed_product("Wireless Mouse", "2.4 GHz mouse", dec!(199), 10, true)
        .await;
    // Too expensive to be handed out
    app.seed_product("Mechanical Keyboard", "RGB keyboard", dec!(2500), 10, true)
        .await;

    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, checkout_for(&laptop, dec!(60000), dec!(10800), "cod"))
        .await
        .unwrap();

    let gift = placed.gift_coupon.expect("gift coupon issued");
    assert!(gift.code.starts_with("GIFT"));
    assert_eq!(gift.code.len(), 10);
    assert_eq!(gift.product_id, mouse.id);

    assert_eq!(placed.order.order_items.len(), 2);
    let gift_line = &placed.order.order_items[1];
    assert!(gift_line.is_gift);
    assert_eq!(gift_line.price, Decimal::ZERO);
    assert_eq!(gift_line.quantity, 1);
    assert_eq!(gift_line.product, mouse.id);
    assert_eq!(gift_line.gift_coupon_code.as_deref(), Some(gift.code.as_str()));
    assert_eq!(gift_line.value, Some(dec!(199)));
    assert_eq!(placed.order.items_price, dec!(60000));

    let stored = Coupon::find()
        .filter(coupon::Column::SourceOrderId.eq(placed.order.id))
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("coupon stored");
    assert_eq!(stored.assigned_to, user.id);
    assert_eq!(stored.metadata["productCategory"], "laptop");
    assert_eq!(stored.usage_limit, 1);

    // Gift stock is not committed by the order
    assert_eq!(app.product(mouse.id).await.stock, 10);
    assert_eq!(app.product(laptop.id).await.stock, 1);

    let coupons = app
        .state
        .services
        .coupons
        .list_for_user(user.id)
        .await
        .unwrap();
    assert_eq!(coupons.len(), 1);
    assert_eq!(coupons[0].gift_item.name, "Wireless Mouse");
}

#[tokio::test]
async fn accessory_only_order_gets_no_gift() {
    let app = TestApp::new().await;
    let user = app.seed_user("Isha", 0, None).await;
    let case = app
        .seed_product("Phone Stand", "Aluminium stand", dec!(900), 5, false)
        .await;
    app.seed_product("Tempered Glass", "Screen guard", dec!(150), 10, true)
        .await;

    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, checkout_for(&case, dec!(900), dec!(162), "cod"))
        .await
        .unwrap();

    assert!(placed.gift_coupon.is_none());
    assert_eq!(placed.order.order_items.len(), 1);
    assert_eq!(Coupon::find().count(&*app.state.db).await.unwrap(), 0);
}

#[tokio::test]
async fn iphone_order_gets_a_screen_protector_gift() {
    let app = TestApp::new().await;
    let user = app.seed_user("Rhea", 0, None).await;
    let phone = app
        .seed_product("Apple iPhone 15", "128 GB smartphone", dec!(70000), 4, false)
        .await;
    let glass = app
        .seed_product("Tempered Glass", "Edge to edge screen guard", dec!(149), 20, true)
        .await;
    // Over the gift price ceiling
    app.seed_product("Back Cover Premium", "Leather back cover", dec!(1200), 20, true)
        .await;
    // Laptop gift, wrong category
    app.seed_product("Wireless Mouse", "2.4 GHz mouse", dec!(199), 20, true)
        .await;

    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, checkout_for(&phone, dec!(70000), dec!(12600), "cod"))
        .await
        .unwrap();

    let gift = placed.gift_coupon.expect("gift coupon issued");
    assert_eq!(gift.product_id, glass.id);
    assert_eq!(gift.gift_item.name, "Tempered Glass");

    let gift_line = placed.order.order_items.last().unwrap();
    assert!(gift_line.is_gift);
    assert_eq!(gift_line.product, glass.id);

    let stored = Coupon::find()
        .filter(coupon::Column::SourceOrderId.eq(placed.order.id))
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("coupon stored");
    assert_eq!(stored.metadata["productCategory"], "iphone");
    assert_eq!(stored.gift_product_id, glass.id);
}

#[tokio::test]
async fn checkout_names_classify_when_stored_products_do_not() {
    let app = TestApp::new().await;
    let user = app.seed_user("Kabir", 0, None).await;
    let device = app
        .seed_product("Model A2337", "Silver, 13 inch", dec!(80000), 3, false)
        .await;
    let keyboard = app
        .seed_product("Compact Keyboard", "Bluetooth keyboard", dec!(349), 10, true)
        .await;

    let mut request = checkout_for(&device, dec!(80000), dec!(14400), "cod");
    request.order_items.as_mut().unwrap()[0].name = Some("MacBook Air 13".to_string());

    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, request)
        .await
        .unwrap();

    let gift = placed.gift_coupon.expect("gift coupon issued");
    assert_eq!(gift.product_id, keyboard.id);

    let stored = Coupon::find()
        .filter(coupon::Column::SourceOrderId.eq(placed.order.id))
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("coupon stored");
    assert_eq!(stored.metadata["productCategory"], "laptop");
    assert_eq!(stored.metadata["sourceProductName"], "MacBook Air 13");
}

#[tokio::test]
async fn gift_engine_falls_back_to_the_supplied_name_map() {
    let app = TestApp::new().await;
    let user = app.seed_user("Nila", 0, None).await;
    let device = app
        .seed_product("Model A2337", "Silver, 13 inch", dec!(80000), 3, false)
        .await;
    app.seed_product("Screen Cleaner Kit", "Spray and cloth", dec!(99), 10, true)
        .await;

    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, checkout_for(&device, dec!(80000), dec!(14400), "cod"))
        .await
        .unwrap();
    assert!(placed.gift_coupon.is_none());

    let db = &*app.state.db;
    let issued = gifts::create_gift_coupon(
        db,
        user.id,
        placed.order.id,
        &[(device.id, "Portable computer".to_string())],
    )
    .await
    .unwrap();
    assert!(issued.is_some_and(|issued| issued.gift_product.name == "Screen Cleaner Kit"));

    // One coupon per order
    let again = gifts::create_gift_coupon(
        db,
        user.id,
        placed.order.id,
        &[(device.id, "Portable computer".to_string())],
    )
    .await
    .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn discount_allowance_comes_from_the_balance() {
    let app = TestApp::new().await;
    let user = app.seed_user("Yash", 250_000, None).await;
    let laptop = app
        .seed_product("Asus Zenbook Laptop", "Laptop", dec!(50000), 3, false)
        .await;

    let mut request = checkout_for(&laptop, dec!(50000), dec!(9000), "cod");
    request.coins_used = Some(100_000);
    request.coin_discount = Some(dec!(2000));

    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, request)
        .await
        .unwrap();

    assert_eq!(placed.order.final_amount, dec!(57000));
    assert_eq!(app.user(user.id).await.coins, 250_000 - 100_000 + 570);
}

#[tokio::test]
async fn order_numbers_skip_ones_already_stored() {
    let app = TestApp::new().await;
    let user = app.seed_user("Pia", 0, None).await;
    let laptop = app
        .seed_product("Chromebook Go", "Laptop", dec!(20000), 3, false)
        .await;
    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, checkout_for(&laptop, dec!(20000), dec!(3600), "cod"))
        .await
        .unwrap();
    let taken = placed.order.order_id.clone();
    let db = &*app.state.db;

    let number = unused_order_number(db, vec![taken.clone(), "ORD-20240309-ZZZZZZ".to_string()])
        .await
        .unwrap();
    assert_eq!(number, "ORD-20240309-ZZZZZZ");

    let err = unused_order_number(db, std::iter::repeat(taken))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InternalError(_));
}

#[tokio::test]
async fn referral_bonus_is_paid_on_first_order_only() {
    let app = TestApp::new().await;
    let referrer = app.seed_user("Arjun", 0, None).await;
    let buyer = app.seed_user("Tara", 0, Some(referrer.id)).await;
    let referral = app.seed_referral(referrer.id, buyer.id).await;
    let laptop = app
        .seed_product("MacBook Air", "Apple laptop", dec!(90000), 5, false)
        .await;

    let orders = &app.state.services.orders;
    orders
        .place_order(buyer.id, checkout_for(&laptop, dec!(90000), dec!(16200), "cod"))
        .await
        .unwrap();
    orders
        .place_order(buyer.id, checkout_for(&laptop, dec!(90000), dec!(16200), "cod"))
        .await
        .unwrap();

    let referrer_after = app.user(referrer.id).await;
    assert_eq!(referrer_after.coins, 5000);
    assert_eq!(referrer_after.referral_total_earnings, 5000);
    assert_eq!(referrer_after.total_earned, 5000);

    let stored = Referral::find_by_id(referral.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.first_order_completed);
    assert_eq!(stored.status, referral::STATUS_COMPLETED);
    assert_eq!(stored.order_reward, 5000);
    assert_eq!(stored.total_rewards, 5000);

    let bonus_entries = CoinTransaction::find()
        .filter(coin_transaction::Column::UserId.eq(referrer.id))
        .filter(coin_transaction::Column::Source.eq(SOURCE_REFERRAL_FIRST_ORDER))
        .filter(coin_transaction::Column::TransactionType.eq(CoinTransactionType::Earned))
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(bonus_entries, 1);
}

#[tokio::test]
async fn gateway_failure_persists_nothing() {
    let mut gateway = MockGateway::new();
    gateway.expect_create_order().times(1).returning(|_, _, _| {
        Err(ServiceError::PaymentGatewayError {
            message: "The amount must be atleast INR 1.00".to_string(),
            reason: Some("input_validation_failed".to_string()),
            field: Some("amount".to_string()),
        })
    });
    let app = TestApp::with_gateway(Arc::new(gateway)).await;
    let user = app.seed_user("Zoya", 0, None).await;
    let laptop = app
        .seed_product("Surface Laptop", "Laptop", dec!(80000), 2, false)
        .await;

    let err = app
        .state
        .services
        .orders
        .place_order(user.id, checkout_for(&laptop, dec!(80000), dec!(14400), "razorpay"))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::PaymentGatewayError { field: Some(f), .. } if f == "amount");
    assert_eq!(order_count(&app).await, 0);
    assert_eq!(app.product(laptop.id).await.stock, 2);
}

#[tokio::test]
async fn online_order_is_opened_in_minor_units_and_verified() {
    let mut gateway = MockGateway::new();
    gateway
        .expect_create_order()
        .withf(|amount, currency, receipt| {
            *amount == 5_700_000 && currency == "INR" && receipt.starts_with("ORD-")
        })
        .times(1)
        .returning(|amount, currency, receipt| {
            Ok(GatewayOrder {
                id: "order_Nx81".to_string(),
                amount,
                currency: currency.to_string(),
                receipt: Some(receipt.to_string()),
                status: Some("created".to_string()),
            })
        });
    gateway
        .expect_verify_signature()
        .returning(|order_id, payment_id, signature| {
            order_id == "order_Nx81" && payment_id == "pay_1" && signature == "good"
        });
    let app = TestApp::with_gateway(Arc::new(gateway)).await;
    let user = app.seed_user("Kabir", 0, None).await;
    let laptop = app
        .seed_product("Galaxy Book Laptop", "Laptop", dec!(48305), 2, false)
        .await;

    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, checkout_for(&laptop, dec!(48305), dec!(8695), "razorpay"))
        .await
        .unwrap();
    assert_eq!(placed.razorpay_order_id.as_deref(), Some("order_Nx81"));
    assert_eq!(placed.order.payment_status, order::PAYMENT_STATUS_PENDING);

    let token = app.token_for(user.id);
    let rejected = app
        .request(
            Method::POST,
            "/api/v1/payments/verify",
            Some(json!({
                "razorpayOrderId": "order_Nx81",
                "razorpayPaymentId": "pay_1",
                "razorpaySignature": "forged"
            })),
            Some(&token),
        )
        .await;
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

    let verified = app
        .request(
            Method::POST,
            "/api/v1/payments/verify",
            Some(json!({
                "razorpayOrderId": "order_Nx81",
                "razorpayPaymentId": "pay_1",
                "razorpaySignature": "good"
            })),
            Some(&token),
        )
        .await;
    assert_eq!(verified.status(), StatusCode::OK);
    let body = response_json(verified).await;
    assert_eq!(body["data"]["paymentStatus"], "paid");
    assert!(body["data"]["paidAt"].is_string());
    let history = body["data"]["statusHistory"].as_array().unwrap();
    assert_eq!(history.last().unwrap()["status"], "payment_verified");
}

#[tokio::test]
async fn failed_confirmation_does_not_block_settlement() {
    let mut notifier = MockNotifier::new();
    notifier
        .expect_send_order_confirmation()
        .times(1)
        .returning(|_| Err(ServiceError::ExternalServiceError("relay down".to_string())));
    let app = TestApp::with_collaborators(None, Arc::new(notifier)).await;
    let user = app.seed_user("Leela", 0, None).await;
    let laptop = app
        .seed_product("Dell XPS Laptop", "Laptop", dec!(100000), 2, false)
        .await;

    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, checkout_for(&laptop, dec!(100000), dec!(18000), "cod"))
        .await
        .unwrap();

    assert!(placed.order.settled);
    app.state.services.orders.wait_for_confirmations().await;
    let stored = stored_order(&app, placed.order.id).await;
    assert!(!stored.confirmation_sent);
    assert!(stored.stock_committed);
}

#[tokio::test]
async fn reconcile_does_not_apply_effects_twice() {
    let app = TestApp::new().await;
    let referrer = app.seed_user("Sana", 0, None).await;
    let user = app.seed_user("Om", 250_000, Some(referrer.id)).await;
    app.seed_referral(referrer.id, user.id).await;
    let laptop = app
        .seed_product("ThinkPad X1", "Laptop", dec!(50000), 5, false)
        .await;

    let mut request = checkout_for(&laptop, dec!(50000), dec!(9000), "cod");
    request.coins_used = Some(100_000);
    request.coin_discount = Some(dec!(1000));
    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, request)
        .await
        .unwrap();
    app.state.services.orders.wait_for_confirmations().await;
    let coins_after_placement = app.user(user.id).await.coins;
    assert_eq!(coins_after_placement, 250_000 - 100_000 + 580);
    assert_eq!(app.user(referrer.id).await.coins, 5000);

    mark_unsettled(&app, placed.order.id).await;
    let report = app
        .state
        .services
        .orders
        .reconcile(&placed.order.order_id)
        .await
        .unwrap();
    assert!(report.settled);
    assert_eq!(report.coins_redeemed, 0);
    assert_eq!(report.coins_earned, 0);
    assert!(!report.referral_bonus_credited);
    assert!(report.stock_shortfalls.is_empty());
    assert!(report.failures.is_empty());
    assert!(stored_order(&app, placed.order.id).await.settled);

    let summary = app
        .state
        .services
        .orders
        .reconcile_pending(10)
        .await
        .unwrap();
    assert_eq!(summary.examined, 0);

    assert_eq!(app.user(user.id).await.coins, coins_after_placement);
    assert_eq!(app.user(referrer.id).await.coins, 5000);
    assert_eq!(app.product(laptop.id).await.stock, 4);
    assert_eq!(
        CoinTransaction::find()
            .filter(coin_transaction::Column::UserId.eq(user.id))
            .count(&*app.state.db)
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        CoinTransaction::find()
            .filter(coin_transaction::Column::UserId.eq(referrer.id))
            .count(&*app.state.db)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn stock_shortfall_at_commit_clamps_to_zero() {
    let app = TestApp::new().await;
    let user = app.seed_user("Zoya", 0, None).await;
    let laptop = app
        .seed_product("ThinkPad X1", "Laptop", dec!(50000), 5, false)
        .await;

    let placed = app
        .state
        .services
        .orders
        .place_order(user.id, checkout_for(&laptop, dec!(50000), dec!(9000), "cod"))
        .await
        .unwrap();
    app.state.services.orders.wait_for_confirmations().await;

    // Another checkout drained the product before this order's stock was committed
    Order::update_many()
        .col_expr(order::Column::StockCommitted, Expr::value(false))
        .filter(order::Column::Id.eq(placed.order.id))
        .exec(&*app.state.db)
        .await
        .unwrap();
    Product::update_many()
        .col_expr(product::Column::Stock, Expr::value(0))
        .filter(product::Column::Id.eq(laptop.id))
        .exec(&*app.state.db)
        .await
        .unwrap();
    mark_unsettled(&app, placed.order.id).await;

    let report = app
        .state
        .services
        .orders
        .reconcile(&placed.order.order_id)
        .await
        .unwrap();

    assert!(report.settled);
    assert_eq!(report.stock_shortfalls, vec![laptop.id]);
    assert_eq!(app.product(laptop.id).await.stock, 0);

    let stored = stored_order(&app, placed.order.id).await;
    assert!(stored.stock_committed);
    let history = stored.status_history.as_array().unwrap();
    assert_eq!(
        history.last().unwrap()["note"],
        "Stock shortfall for: ThinkPad X1"
    );
    assert_eq!(history.last().unwrap()["status"], "placed");
}

#[tokio::test]
async fn missing_fields_are_reported_as_bad_request() {
    let app = TestApp::new().await;
    let user = app.seed_user("Ira", 0, None).await;
    let token = app.token_for(user.id);

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "orderItems": [],
                "paymentMethod": "cod"
            })),
            Some(&token),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["message"], "No order items");
    assert_eq!(order_count(&app).await, 0);
}

#[tokio::test]
async fn checkout_requires_a_session() {
    let app = TestApp::new().await;

    let response = app
        .request(Method::POST, "/api/v1/orders", Some(json!({})), None)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .request(Method::GET, "/api/v1/orders", None, Some("not-a-token"))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn session_for_unknown_user_is_not_found() {
    let app = TestApp::new().await;
    let laptop = app
        .seed_product("Surface Laptop", "Laptop", dec!(30000), 3, false)
        .await;
    let token = app.token_for(uuid::Uuid::new_v4());

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(serde_json::to_value(checkout_for(&laptop, dec!(30000), dec!(5400), "cod")).unwrap()),
            Some(&token),
        )
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response_json(response).await;
    assert_eq!(body["message"], "User not found");
    assert_eq!(order_count(&app).await, 0);
    assert_eq!(app.product(laptop.id).await.stock, 3);
}

#[tokio::test]
async fn placed_orders_are_listed_newest_first() {
    let app = TestApp::new().await;
    let user = app.seed_user("Anya", 0, None).await;
    let other = app.seed_user("Bela", 0, None).await;
    let laptop = app
        .seed_product("Chromebook Plus", "Laptop", dec!(30000), 10, false)
        .await;
    let token = app.token_for(user.id);

    let request = json!({
        "orderItems": [{
            "id": laptop.id,
            "name": laptop.name,
            "quantity": 1,
            "price": "30000"
        }],
        "shippingAddress": { "city": "Mumbai" },
        "paymentMethod": "cod",
        "itemsPrice": "30000",
        "taxPrice": "5400",
        "totalPrice": "35400"
    });

    let first = app
        .request(Method::POST, "/api/v1/orders", Some(request.clone()), Some(&token))
        .await;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first = response_json(first).await;
    assert_eq!(first["success"], true);
    assert_eq!(first["data"]["coinsEarned"], 354);

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = app
        .request(Method::POST, "/api/v1/orders", Some(request), Some(&token))
        .await;
    let second = response_json(second).await;

    app.state
        .services
        .orders
        .place_order(other.id, checkout_for(&laptop, dec!(30000), dec!(5400), "cod"))
        .await
        .unwrap();

    let listed = app
        .request(Method::GET, "/api/v1/orders", None, Some(&token))
        .await;
    assert_eq!(listed.status(), StatusCode::OK);
    let listed = response_json(listed).await;
    let orders = listed["data"].as_array().unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0]["orderId"], second["data"]["order"]["orderId"]);
    assert_eq!(orders[1]["orderId"], first["data"]["order"]["orderId"]);

    let order_number = orders[0]["orderId"].as_str().unwrap();
    let fetched = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order_number),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(fetched.status(), StatusCode::OK);

    // Another customer cannot see it
    let other_token = app.token_for(other.id);
    let hidden = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order_number),
            None,
            Some(&other_token),
        )
        .await;
    assert_eq!(hidden.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn coin_summary_reports_balance_and_ledger() {
    let app = TestApp::new().await;
    let user = app.seed_user("Veer", 120_000, None).await;
    let laptop = app
        .seed_product("IdeaPad Slim Laptop", "Laptop", dec!(40000), 3, false)
        .await;
    let mut request = checkout_for(&laptop, dec!(40000), dec!(7200), "cod");
    request.coins_used = Some(100_000);
    request.coin_discount = Some(dec!(1000));
    app.state
        .services
        .orders
        .place_order(user.id, request)
        .await
        .unwrap();

    let token = app.token_for(user.id);
    let response = app
        .request(Method::GET, "/api/v1/coins?limit=5", None, Some(&token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["coins"], 20_000 + 462);
    assert_eq!(body["data"]["totalRedeemed"], 100_000);
    assert_eq!(body["data"]["transactions"].as_array().unwrap().len(), 2);
}
