// 结算数据访问 Repository
// 每个商户最多一笔 pending 聚合行（部分唯一索引保证）

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;

use crate::{
    domain::{Payout, PayoutStatus},
    infrastructure::db::PgPool,
};

const PAYOUT_COLUMNS: &str =
    "id, merchant_id, intent_ids, gross, fee, net, status, tx_hash, created_at, updated_at";

fn payout_from_row(row: &PgRow) -> Result<Payout> {
    Ok(Payout {
        id: row.try_get("id")?,
        merchant_id: row.try_get("merchant_id")?,
        intent_ids: row.try_get("intent_ids")?,
        gross: row.try_get("gross")?,
        fee: row.try_get("fee")?,
        net: row.try_get("net")?,
        status: PayoutStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        tx_hash: row.try_get("tx_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Clone)]
pub struct PayoutRepository {
    pool: PgPool,
}

impl PayoutRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 把一笔已释放的意图挂到商户累积中的聚合行上，返回 payout id
    /// 已提交转账的行不会再被追加（金额在提交时即定格）
    pub async fn attach_intent(
        &self,
        merchant_id: Uuid,
        intent_id: Uuid,
        gross: Decimal,
        fee: Decimal,
        net: Decimal,
    ) -> Result<Uuid> {
        let payout_id: Uuid = sqlx::query_scalar(
            "INSERT INTO payouts (id, merchant_id, intent_ids, gross, fee, net, status) \
             VALUES ($1, $2, ARRAY[$3]::uuid[], $4, $5, $6, 'pending') \
             ON CONFLICT (merchant_id) WHERE status = 'pending' AND tx_hash IS NULL \
             DO UPDATE SET \
                 intent_ids = array_append(payouts.intent_ids, $3), \
                 gross = payouts.gross + EXCLUDED.gross, \
                 fee = payouts.fee + EXCLUDED.fee, \
                 net = payouts.net + EXCLUDED.net, \
                 updated_at = now() \
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(merchant_id)
        .bind(intent_id)
        .bind(gross)
        .bind(fee)
        .bind(net)
        .fetch_one(&self.pool)
        .await
        .context("Failed to attach intent to payout")?;

        Ok(payout_id)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Payout>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payouts WHERE id = $1",
            PAYOUT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query payout")?;

        row.as_ref().map(payout_from_row).transpose()
    }

    /// 商户的全部待结算行（最多两笔：一笔累积中、一笔已提交待确认）
    pub async fn find_pending_for_merchant(&self, merchant_id: Uuid) -> Result<Vec<Payout>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payouts WHERE merchant_id = $1 AND status = 'pending' \
             ORDER BY created_at ASC",
            PAYOUT_COLUMNS
        ))
        .bind(merchant_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query pending payouts")?;

        rows.iter().map(payout_from_row).collect()
    }

    /// 转账已提交但未确认：只记录哈希，状态保持 pending
    pub async fn record_submission(&self, id: Uuid, tx_hash: &str) -> Result<()> {
        sqlx::query(
            "UPDATE payouts SET tx_hash = $2, updated_at = now() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(tx_hash)
        .execute(&self.pool)
        .await
        .context("Failed to record payout submission")?;
        Ok(())
    }

    pub async fn mark_sent(&self, id: Uuid, tx_hash: &str) -> Result<()> {
        sqlx::query(
            "UPDATE payouts SET status = 'sent', tx_hash = $2, updated_at = now() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(tx_hash)
        .execute(&self.pool)
        .await
        .context("Failed to mark payout sent")?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE payouts SET status = 'failed', updated_at = now() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark payout failed")?;
        Ok(())
    }
}
