//! 统一 API 响应格式
//!
//! 成功：{ success: true, data, meta: { timestamp, request_id } }
//! 失败：{ success: false, error: { code, message, details? }, meta } （见 error.rs）

use axum::Json;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Serialize)]
pub struct Meta {
    pub timestamp: String,
    pub request_id: String,
}

impl Meta {
    pub fn new(request_id: String) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            request_id,
        }
    }
}

/// 统一成功响应
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    pub meta: Meta,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T, request_id: String) -> Self {
        Self {
            success: true,
            data,
            meta: Meta::new(request_id),
        }
    }
}

/// 辅助函数：包装成功响应（自动生成 request_id）
pub fn success_response<T: Serialize>(
    data: T,
    request_id: String,
) -> Result<Json<ApiResponse<T>>, AppError> {
    Ok(Json(ApiResponse::success(data, request_id)))
}

/// 每个请求一个关联 ID，贯穿响应 meta 与日志
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}
