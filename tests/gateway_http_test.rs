//! HTTP-level tests of the ingress gateway router.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::TestStack;
use serde_json::{json, Value};
use tower::ServiceExt;

fn gateway_router(stack: &TestStack) -> Router {
    payflow::handlers::payments::routes(payflow::handlers::payments::GatewayState {
        payments: Arc::clone(&stack.payments),
    })
}

fn post_payment(key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/payments")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header("Idempotency-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn valid_body() -> Value {
    json!({
        "amount": "50.00",
        "currency": "USD",
        "customer_id": "C1",
        "merchant_id": "M1",
    })
}

#[tokio::test]
async fn missing_idempotency_key_is_rejected() {
    let stack = TestStack::start().await;
    let app = gateway_router(&stack);

    let response = app.oneshot(post_payment(None, valid_body())).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("Idempotency-Key"));

    stack.shutdown().await;
}

#[tokio::test]
async fn incomplete_body_is_a_validation_error() {
    let stack = TestStack::start().await;
    let app = gateway_router(&stack);

    let response = app
        .clone()
        .oneshot(post_payment(
            Some("K-bad"),
            json!({ "amount": "50.00", "currency": "USD" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Wrong-shaped currency is caught by field validation.
    let response = app
        .oneshot(post_payment(
            Some("K-bad2"),
            json!({
                "amount": "50.00",
                "currency": "US",
                "customer_id": "C1",
                "merchant_id": "M1",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    stack.shutdown().await;
}

#[tokio::test]
async fn negative_amount_is_rejected() {
    let stack = TestStack::start().await;
    let app = gateway_router(&stack);

    let response = app
        .oneshot(post_payment(
            Some("K-neg"),
            json!({
                "amount": "-1.00",
                "currency": "USD",
                "customer_id": "C1",
                "merchant_id": "M1",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    stack.shutdown().await;
}

#[tokio::test]
async fn create_then_fetch_round_trips() {
    let stack = TestStack::start().await;
    let app = gateway_router(&stack);

    let response = app
        .clone()
        .oneshot(post_payment(Some("K-http"), valid_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["status"], "NEW");
    let amount: rust_decimal::Decimal = created["amount"].as_str().unwrap().parse().unwrap();
    assert_eq!(amount, rust_decimal_macros::dec!(50.00));
    let id = created["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri(format!("/payments/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["id"], id.as_str());

    // Unknown id is a 404.
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri(format!("/payments/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    stack.shutdown().await;
}

#[tokio::test]
async fn replay_returns_200_with_identical_body() {
    let stack = TestStack::start().await;
    let app = gateway_router(&stack);

    let first = app
        .clone()
        .oneshot(post_payment(Some("K-same"), valid_body()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let first_body = body_json(first).await;

    let second = app
        .oneshot(post_payment(Some("K-same"), valid_body()))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = body_json(second).await;

    assert_eq!(first_body, second_body);

    stack.shutdown().await;
}

#[tokio::test]
async fn confirm_marks_payment_confirmed() {
    let stack = TestStack::start().await;
    let app = gateway_router(&stack);

    let response = app
        .clone()
        .oneshot(post_payment(Some("K-confirm"), valid_body()))
        .await
        .unwrap();
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/payments/{id}/confirm"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Give the lifecycle a moment, then check the stored status stuck.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fetched = app
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri(format!("/payments/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let fetched = body_json(fetched).await;
    assert_eq!(fetched["status"], "CONFIRMED");

    stack.shutdown().await;
}
