//! REST 表层集成测试：鉴权、响应信封、错误码
//!
//! ```bash
//! TEST_DATABASE_URL=postgres://... cargo test --test api_surface_test -- --ignored --test-threads=1
//! ```

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use common::{seed_merchant, test_app};
use tower::util::ServiceExt;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
#[ignore]
async fn create_returns_envelope_with_intent() {
    let app = test_app().await;
    let (_merchant_id, api_key) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;
    let router = dotgate::api::routes(app.state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/payment-intents")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {}", api_key))
        .body(Body::from(
            serde_json::json!({
                "amount": 10000,
                "currency": "usd",
                "crypto_currency": "dot",
            })
            .to_string(),
        ))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "requires_payment");
    assert_eq!(body["data"]["crypto_amount"], "20.000000000000000000");
    assert_eq!(body["data"]["deposit_address"], common::TEST_ESCROW);
    assert!(body["meta"]["request_id"].is_string());
    assert!(body["meta"]["timestamp"].is_string());
}

#[tokio::test]
#[ignore]
async fn validation_errors_use_envelope_codes() {
    let app = test_app().await;
    let (_merchant_id, api_key) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;
    let router = dotgate::api::routes(app.state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/payment-intents")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {}", api_key))
        .body(Body::from(
            serde_json::json!({
                "amount": 10000,
                "currency": "chf",
                "crypto_currency": "dot",
            })
            .to_string(),
        ))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
#[ignore]
async fn unknown_api_key_is_rejected() {
    let app = test_app().await;
    let router = dotgate::api::routes(app.state.clone());

    let request = Request::builder()
        .method("GET")
        .uri("/v1/payment-intents")
        .header(header::AUTHORIZATION, "Bearer sk_test_unknown")
        .body(Body::empty())
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "MERCHANT_NOT_FOUND");
}

#[tokio::test]
#[ignore]
async fn read_and_list_are_merchant_scoped() {
    let app = test_app().await;
    let (_merchant_a, key_a) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;
    let (_merchant_b, key_b) = seed_merchant(&app.pool, "http://127.0.0.1:1/hook", 250).await;
    let router = dotgate::api::routes(app.state.clone());

    // A 创建
    let request = Request::builder()
        .method("POST")
        .uri("/v1/payment-intents")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {}", key_a))
        .body(Body::from(
            serde_json::json!({
                "amount": 5000,
                "currency": "usd",
                "crypto_currency": "dot",
            })
            .to_string(),
        ))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let body = body_json(response).await;
    let intent_id = body["data"]["id"].as_str().unwrap().to_string();

    // A 可读
    let request = Request::builder()
        .uri(format!("/v1/payment-intents/{}", intent_id))
        .header(header::AUTHORIZATION, format!("Bearer {}", key_a))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // B 不可见
    let request = Request::builder()
        .uri(format!("/v1/payment-intents/{}", intent_id))
        .header(header::AUTHORIZATION, format!("Bearer {}", key_b))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "PAYMENT_INTENT_NOT_FOUND");

    // 列表按状态过滤
    let request = Request::builder()
        .uri("/v1/payment-intents?status=requires_payment&limit=10")
        .header(header::AUTHORIZATION, format!("Bearer {}", key_a))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["data"]["total"].as_i64().unwrap() >= 1);

    // 非法 id 走统一校验错误
    let request = Request::builder()
        .uri("/v1/payment-intents/not-a-uuid")
        .header(header::AUTHORIZATION, format!("Bearer {}", key_a))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
