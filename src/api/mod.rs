//! API 路由

pub mod middleware;
pub mod payment_intent_api;
pub mod response;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{app_state::AppState, infrastructure::db};

/// 全部路由 + 中间件
pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v1/payment-intents",
            post(payment_intent_api::create_payment_intent)
                .get(payment_intent_api::list_payment_intents),
        )
        .route(
            "/v1/payment-intents/:id",
            get(payment_intent_api::get_payment_intent),
        )
        .route(
            "/v1/payment-intents/:id/confirm",
            post(payment_intent_api::confirm_payment_intent),
        )
        .route(
            "/v1/payment-intents/:id/cancel",
            post(payment_intent_api::cancel_payment_intent),
        )
        .route(
            "/v1/payment-intents/:id/refund",
            post(payment_intent_api::refund_payment_intent),
        )
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /healthz - 存活与数据库连通性
async fn healthz(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl axum::response::IntoResponse {
    match db::health_check(&state.pool).await {
        Ok(()) => (axum::http::StatusCode::OK, "ok"),
        Err(_) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, "db unavailable"),
    }
}

/// GET /metrics - 文本格式指标
async fn metrics_text() -> String {
    crate::metrics::render()
}
