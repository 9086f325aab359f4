// 商户数据访问 Repository（核心只读，结算时间戳除外）

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;

use crate::{
    domain::{Merchant, PayoutSchedule},
    infrastructure::db::PgPool,
};

const MERCHANT_COLUMNS: &str = "id, wallet_address, webhook_url, webhook_secret, \
     platform_fee_bps, payout_schedule, min_payout_amount, is_active, last_payout_at, created_at";

fn merchant_from_row(row: &PgRow) -> Result<Merchant> {
    Ok(Merchant {
        id: row.try_get("id")?,
        wallet_address: row.try_get("wallet_address")?,
        webhook_url: row.try_get("webhook_url")?,
        webhook_secret: row.try_get("webhook_secret")?,
        platform_fee_bps: row.try_get("platform_fee_bps")?,
        payout_schedule: PayoutSchedule::parse(
            row.try_get::<String, _>("payout_schedule")?.as_str(),
        )?,
        min_payout_amount: row.try_get("min_payout_amount")?,
        is_active: row.try_get("is_active")?,
        last_payout_at: row.try_get("last_payout_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Clone)]
pub struct MerchantRepository {
    pool: PgPool,
}

impl MerchantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Merchant>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM merchants WHERE id = $1 AND is_active",
            MERCHANT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query merchant")?;

        row.as_ref().map(merchant_from_row).transpose()
    }

    /// API key 鉴权：按 SHA-256(key) 查找
    pub async fn find_by_api_key_hash(&self, key_hash: &str) -> Result<Option<Merchant>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM merchants WHERE api_key_hash = $1 AND is_active",
            MERCHANT_COLUMNS
        ))
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query merchant by api key")?;

        row.as_ref().map(merchant_from_row).transpose()
    }

    /// 参与定时结算的商户（Manual 除外）
    pub async fn find_scheduled(&self) -> Result<Vec<Merchant>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM merchants WHERE is_active AND payout_schedule <> 'manual'",
            MERCHANT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to query scheduled merchants")?;

        rows.iter().map(merchant_from_row).collect()
    }

    pub async fn set_last_payout_at(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE merchants SET last_payout_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("Failed to update merchant payout timestamp")?;
        Ok(())
    }
}
