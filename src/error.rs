//! API 错误类型
//! IntentEngine 的类型化错误在这里统一翻译为对外错误码

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorCode {
    PaymentIntentNotFound,
    InvalidState,
    PriceUnavailable,
    ChainUnavailable,
    ValidationError,
    MerchantNotFound,
    InternalError,
}

impl AppErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppErrorCode::PaymentIntentNotFound => "PAYMENT_INTENT_NOT_FOUND",
            AppErrorCode::InvalidState => "INVALID_STATE",
            AppErrorCode::PriceUnavailable => "PRICE_UNAVAILABLE",
            AppErrorCode::ChainUnavailable => "CHAIN_UNAVAILABLE",
            AppErrorCode::ValidationError => "VALIDATION_ERROR",
            AppErrorCode::MerchantNotFound => "MERCHANT_NOT_FOUND",
            AppErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppErrorCode::PaymentIntentNotFound => StatusCode::NOT_FOUND,
            AppErrorCode::InvalidState => StatusCode::CONFLICT,
            AppErrorCode::PriceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppErrorCode::ChainUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            AppErrorCode::MerchantNotFound => StatusCode::NOT_FOUND,
            AppErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub code: AppErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub request_id: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = self
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let body = json!({
            "success": false,
            "error": ErrorBody {
                code: self.code.as_str(),
                message: &self.message,
                details: self.details.as_ref(),
            },
            "meta": {
                "timestamp": Utc::now().to_rfc3339(),
                "request_id": request_id,
            },
        });
        (self.code.status(), Json(body)).into_response()
    }
}

impl AppError {
    pub fn new(code: AppErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
            details: None,
            request_id: None,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::PaymentIntentNotFound, msg)
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::InvalidState, msg)
    }

    pub fn price_unavailable(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::PriceUnavailable, msg)
    }

    pub fn chain_unavailable(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::ChainUnavailable, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::ValidationError, msg)
    }

    pub fn merchant_not_found(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::MerchantNotFound, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::InternalError, msg)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// 关联请求ID，响应 meta 与日志使用同一个值
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found("Resource not found"),
            _ => Self::internal(format!("Database operation failed: {}", err)),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_expected_statuses() {
        assert_eq!(
            AppErrorCode::PriceUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(AppErrorCode::InvalidState.status(), StatusCode::CONFLICT);
        assert_eq!(
            AppErrorCode::ValidationError.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppErrorCode::PriceUnavailable.as_str(), "PRICE_UNAVAILABLE");
    }
}
