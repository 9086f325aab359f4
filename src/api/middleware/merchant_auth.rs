//! 商户鉴权提取器
//! Authorization: Bearer <api-key>，按 SHA-256(key) 反查商户。
//! 核心只消费解析出的商户身份；更重的会话/签名栈在网关外层。

use axum::{extract::FromRequestParts, http::request::Parts};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::{app_state::AppState, domain::Merchant, error::AppError};

pub struct MerchantAuth(pub Merchant);

pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for MerchantAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::merchant_not_found("Missing Authorization header"))?;

        let api_key = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::merchant_not_found("Authorization must be a bearer key"))?
            .trim();
        if api_key.is_empty() {
            return Err(AppError::merchant_not_found("Empty API key"));
        }

        let merchant = state
            .merchants
            .find_by_api_key_hash(&hash_api_key(api_key))
            .await
            .map_err(AppError::from)?
            .ok_or_else(|| AppError::merchant_not_found("Unknown API key"))?;

        Ok(MerchantAuth(merchant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_hash_is_sha256_hex() {
        // echo -n "test" | sha256sum
        assert_eq!(
            hash_api_key("test"),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }
}
