use assert_matches::assert_matches;
use serde_json::json;
use storefront_api::{
    errors::ServiceError,
    services::payments::{payment_signature, PaymentGateway, RazorpayClient},
};
use wiremock::{
    matchers::{basic_auth, body_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

#[tokio::test]
async fn creates_order_with_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(basic_auth("rzp_test_key", "rzp_test_secret"))
        .and(body_json(json!({
            "amount": 5_700_000,
            "currency": "INR",
            "receipt": "ORD-20240309-AB12CD"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "order_IluGWxBm9U8zJ8",
            "entity": "order",
            "amount": 5_700_000,
            "amount_paid": 0,
            "currency": "INR",
            "receipt": "ORD-20240309-AB12CD",
            "status": "created"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = RazorpayClient::new("rzp_test_key", "rzp_test_secret", server.uri()).unwrap();
    let order = client
        .create_order(5_700_000, "INR", "ORD-20240309-AB12CD")
        .await
        .unwrap();

    assert_eq!(order.id, "order_IluGWxBm9U8zJ8");
    assert_eq!(order.amount, 5_700_000);
    assert_eq!(order.status.as_deref(), Some("created"));
}

#[tokio::test]
async fn gateway_rejection_keeps_reason_and_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "code": "BAD_REQUEST_ERROR",
                "description": "The amount must be atleast INR 1.00",
                "source": "business",
                "step": "payment_initiation",
                "reason": "input_validation_failed",
                "field": "amount"
            }
        })))
        .mount(&server)
        .await;

    let client = RazorpayClient::new("key", "secret", server.uri()).unwrap();
    let err = client.create_order(50, "INR", "ORD-1").await.unwrap_err();

    assert_matches!(
        err,
        ServiceError::PaymentGatewayError { message, reason, field }
            if message == "The amount must be atleast INR 1.00"
                && reason.as_deref() == Some("input_validation_failed")
                && field.as_deref() == Some("amount")
    );
}

#[tokio::test]
async fn unparseable_failure_reports_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let client = RazorpayClient::new("key", "secret", format!("{}/", server.uri())).unwrap();
    let err = client.create_order(100, "INR", "ORD-2").await.unwrap_err();

    assert_matches!(err, ServiceError::PaymentGatewayError { message, .. } if message.contains("502"));
}

#[test]
fn verifies_checkout_signature_with_key_secret() {
    let client = RazorpayClient::new("key", "secret", "http://localhost").unwrap();
    let signature = payment_signature("secret", "order_1", "pay_1");

    assert!(client.verify_signature("order_1", "pay_1", &signature));
    assert!(!client.verify_signature("order_1", "pay_2", &signature));
    assert!(!client.verify_signature("order_1", "pay_1", "not-hex"));
}
