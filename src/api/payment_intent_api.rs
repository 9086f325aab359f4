//! 支付意图 API
//! 薄壳：鉴权提取器给出商户身份，业务全部走 IntentEngine；
//! 读路径直接查存储（不走意图锁）

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    api::{
        middleware::merchant_auth::MerchantAuth,
        response::{new_request_id, success_response, ApiResponse},
    },
    app_state::AppState,
    domain::{FiatCurrency, IntentStatus},
    error::AppError,
    repository::IntentFilter,
    service::intent_engine::CreateIntentParams,
};

#[derive(Debug, Deserialize)]
pub struct CreatePaymentIntentRequest {
    /// 法币金额（最小单位）
    pub amount: i64,
    /// 法币币种（usd/eur/gbp/jpy）
    pub currency: String,
    pub crypto_currency: String,
    pub release_method: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ListPaymentIntentsQuery {
    pub status: Option<String>,
    pub currency: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

fn parse_intent_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw)
        .map_err(|_| AppError::validation(format!("Invalid payment intent id: {}", raw)))
}

/// POST /v1/payment-intents
pub async fn create_payment_intent(
    State(state): State<Arc<AppState>>,
    MerchantAuth(merchant): MerchantAuth,
    Json(req): Json<CreatePaymentIntentRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let request_id = new_request_id();

    let intent = state
        .engine
        .create(
            merchant.id,
            CreateIntentParams {
                fiat_amount: req.amount,
                fiat_currency: req.currency,
                crypto_currency: req.crypto_currency,
                release_method: req.release_method,
                metadata: req.metadata,
            },
        )
        .await
        .map_err(|e| AppError::from(e).with_request_id(request_id.clone()))?;

    success_response(intent.api_view(), request_id)
}

/// GET /v1/payment-intents/:id
pub async fn get_payment_intent(
    State(state): State<Arc<AppState>>,
    MerchantAuth(merchant): MerchantAuth,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let request_id = new_request_id();
    let intent_id = parse_intent_id(&id)?;

    let intent = state
        .intents
        .find_for_merchant(merchant.id, intent_id)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| {
            AppError::not_found(format!("Payment intent {} not found", intent_id))
                .with_request_id(request_id.clone())
        })?;

    success_response(intent.api_view(), request_id)
}

/// GET /v1/payment-intents
pub async fn list_payment_intents(
    State(state): State<Arc<AppState>>,
    MerchantAuth(merchant): MerchantAuth,
    Query(query): Query<ListPaymentIntentsQuery>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let request_id = new_request_id();

    let status = query
        .status
        .as_deref()
        .map(IntentStatus::parse)
        .transpose()
        .map_err(|e| AppError::validation(e.to_string()))?;
    let fiat_currency = query
        .currency
        .as_deref()
        .map(FiatCurrency::parse)
        .transpose()
        .map_err(|e| AppError::validation(e.to_string()))?;

    let filter = IntentFilter {
        status,
        fiat_currency,
        date_from: query.date_from,
        date_to: query.date_to,
        page: query.page.unwrap_or(1),
        limit: query.limit.unwrap_or(20),
    };

    let (intents, total) = state
        .intents
        .list(merchant.id, &filter)
        .await
        .map_err(AppError::from)?;

    let limit = filter.limit.clamp(1, 100) as i64;
    let total_pages = (total + limit - 1) / limit;

    success_response(
        serde_json::json!({
            "payment_intents": intents.iter().map(|i| i.api_view()).collect::<Vec<_>>(),
            "total": total,
            "page": filter.page.max(1),
            "limit": limit,
            "total_pages": total_pages,
        }),
        request_id,
    )
}

/// POST /v1/payment-intents/:id/confirm - 手动释放
pub async fn confirm_payment_intent(
    State(state): State<Arc<AppState>>,
    MerchantAuth(merchant): MerchantAuth,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let request_id = new_request_id();
    let intent_id = parse_intent_id(&id)?;

    let intent = state
        .engine
        .confirm(merchant.id, intent_id)
        .await
        .map_err(|e| AppError::from(e).with_request_id(request_id.clone()))?;

    success_response(intent.api_view(), request_id)
}

/// POST /v1/payment-intents/:id/cancel
pub async fn cancel_payment_intent(
    State(state): State<Arc<AppState>>,
    MerchantAuth(merchant): MerchantAuth,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let request_id = new_request_id();
    let intent_id = parse_intent_id(&id)?;

    let intent = state
        .engine
        .cancel(merchant.id, intent_id)
        .await
        .map_err(|e| AppError::from(e).with_request_id(request_id.clone()))?;

    success_response(intent.api_view(), request_id)
}

/// POST /v1/payment-intents/:id/refund
pub async fn refund_payment_intent(
    State(state): State<Arc<AppState>>,
    MerchantAuth(merchant): MerchantAuth,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let request_id = new_request_id();
    let intent_id = parse_intent_id(&id)?;

    let intent = state
        .engine
        .refund(merchant.id, intent_id)
        .await
        .map_err(|e| AppError::from(e).with_request_id(request_id.clone()))?;

    success_response(intent.api_view(), request_id)
}
