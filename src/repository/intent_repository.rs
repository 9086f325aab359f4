// 支付意图数据访问 Repository
// 状态列的条件更新是状态机在存储层的最后一道闸：WHERE 带上旧状态，
// 并发写入时后到者影响 0 行

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;

use crate::{
    domain::{
        CryptoCurrency, FiatCurrency, IntentStatus, PaymentIntent, ReleaseMethod,
    },
    infrastructure::db::PgPool,
};

const INTENT_COLUMNS: &str = "id, merchant_id, fiat_amount, fiat_currency, crypto_amount, \
     crypto_currency, quote_rate, quote_taken_at, status, escrow_payment_id, \
     escrow_creation_tx, release_tx, refund_tx, deposit_address, expires_at, \
     release_method, deposit_observed, failure_reason, reconcile_required, payout_id, \
     metadata, created_at, updated_at";

/// 列表过滤条件
#[derive(Debug, Clone, Default)]
pub struct IntentFilter {
    pub status: Option<IntentStatus>,
    pub fiat_currency: Option<FiatCurrency>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub page: u32,
    pub limit: u32,
}

#[derive(Clone)]
pub struct IntentRepository {
    pool: PgPool,
}

fn intent_from_row(row: &PgRow) -> Result<PaymentIntent> {
    Ok(PaymentIntent {
        id: row.try_get("id")?,
        merchant_id: row.try_get("merchant_id")?,
        fiat_amount: row.try_get("fiat_amount")?,
        fiat_currency: FiatCurrency::parse(row.try_get::<String, _>("fiat_currency")?.as_str())?,
        crypto_amount: row.try_get("crypto_amount")?,
        crypto_currency: CryptoCurrency::parse(
            row.try_get::<String, _>("crypto_currency")?.as_str(),
        )?,
        quote_rate: row.try_get("quote_rate")?,
        quote_taken_at: row.try_get("quote_taken_at")?,
        status: IntentStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        escrow_payment_id: row.try_get("escrow_payment_id")?,
        escrow_creation_tx: row.try_get("escrow_creation_tx")?,
        release_tx: row.try_get("release_tx")?,
        refund_tx: row.try_get("refund_tx")?,
        deposit_address: row.try_get("deposit_address")?,
        expires_at: row.try_get("expires_at")?,
        release_method: ReleaseMethod::parse(
            row.try_get::<String, _>("release_method")?.as_str(),
        )?,
        deposit_observed: row.try_get("deposit_observed")?,
        failure_reason: row.try_get("failure_reason")?,
        reconcile_required: row.try_get("reconcile_required")?,
        payout_id: row.try_get("payout_id")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl IntentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, intent: &PaymentIntent) -> Result<()> {
        sqlx::query(
            "INSERT INTO payment_intents \
             (id, merchant_id, fiat_amount, fiat_currency, crypto_amount, crypto_currency, \
              quote_rate, quote_taken_at, status, escrow_creation_tx, deposit_address, \
              expires_at, release_method, metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(intent.id)
        .bind(intent.merchant_id)
        .bind(intent.fiat_amount)
        .bind(intent.fiat_currency.as_str())
        .bind(intent.crypto_amount)
        .bind(intent.crypto_currency.as_str())
        .bind(intent.quote_rate)
        .bind(intent.quote_taken_at)
        .bind(intent.status.as_str())
        .bind(&intent.escrow_creation_tx)
        .bind(&intent.deposit_address)
        .bind(intent.expires_at)
        .bind(intent.release_method.as_str())
        .bind(&intent.metadata)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert payment intent")?;

        Ok(())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentIntent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payment_intents WHERE id = $1",
            INTENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query payment intent")?;

        row.as_ref().map(intent_from_row).transpose()
    }

    /// 商户视角的查询（跨商户不可见）
    pub async fn find_for_merchant(
        &self,
        merchant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<PaymentIntent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payment_intents WHERE id = $1 AND merchant_id = $2",
            INTENT_COLUMNS
        ))
        .bind(id)
        .bind(merchant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query payment intent")?;

        row.as_ref().map(intent_from_row).transpose()
    }

    /// 按创建交易哈希定位（PaymentCreated 回填 escrow_payment_id 用）
    pub async fn find_by_escrow_creation_tx(&self, tx_hash: &str) -> Result<Option<PaymentIntent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payment_intents WHERE escrow_creation_tx = $1",
            INTENT_COLUMNS
        ))
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query intent by creation tx")?;

        row.as_ref().map(intent_from_row).transpose()
    }

    pub async fn find_by_escrow_payment_id(
        &self,
        payment_id: i64,
    ) -> Result<Option<PaymentIntent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payment_intents WHERE escrow_payment_id = $1",
            INTENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query intent by escrow payment id")?;

        row.as_ref().map(intent_from_row).transpose()
    }

    pub async fn list(
        &self,
        merchant_id: Uuid,
        filter: &IntentFilter,
    ) -> Result<(Vec<PaymentIntent>, i64)> {
        let mut conditions = vec!["merchant_id = $1".to_string()];
        let mut arg_idx = 2;
        if filter.status.is_some() {
            conditions.push(format!("status = ${}", arg_idx));
            arg_idx += 1;
        }
        if filter.fiat_currency.is_some() {
            conditions.push(format!("fiat_currency = ${}", arg_idx));
            arg_idx += 1;
        }
        if filter.date_from.is_some() {
            conditions.push(format!("created_at >= ${}", arg_idx));
            arg_idx += 1;
        }
        if filter.date_to.is_some() {
            conditions.push(format!("created_at <= ${}", arg_idx));
            arg_idx += 1;
        }
        let where_clause = conditions.join(" AND ");

        let limit = filter.limit.clamp(1, 100) as i64;
        let offset = (filter.page.max(1) as i64 - 1) * limit;

        let list_sql = format!(
            "SELECT {} FROM payment_intents WHERE {} ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
            INTENT_COLUMNS,
            where_clause,
            arg_idx,
            arg_idx + 1
        );
        let count_sql = format!(
            "SELECT COUNT(*) FROM payment_intents WHERE {}",
            where_clause
        );

        let mut list_query = sqlx::query(&list_sql).bind(merchant_id);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql).bind(merchant_id);
        if let Some(status) = filter.status {
            list_query = list_query.bind(status.as_str());
            count_query = count_query.bind(status.as_str());
        }
        if let Some(currency) = filter.fiat_currency {
            list_query = list_query.bind(currency.as_str());
            count_query = count_query.bind(currency.as_str());
        }
        if let Some(from) = filter.date_from {
            list_query = list_query.bind(from);
            count_query = count_query.bind(from);
        }
        if let Some(to) = filter.date_to {
            list_query = list_query.bind(to);
            count_query = count_query.bind(to);
        }
        list_query = list_query.bind(limit).bind(offset);

        let rows = list_query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list payment intents")?;
        let total = count_query
            .fetch_one(&self.pool)
            .await
            .context("Failed to count payment intents")?;

        let intents = rows
            .iter()
            .map(intent_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((intents, total))
    }

    /// 回填合约分配的 escrow_payment_id；只允许写一次
    pub async fn set_escrow_payment_id(&self, id: Uuid, payment_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE payment_intents \
             SET escrow_payment_id = $2, updated_at = now() \
             WHERE id = $1 AND escrow_payment_id IS NULL",
        )
        .bind(id)
        .bind(payment_id)
        .execute(&self.pool)
        .await
        .context("Failed to set escrow payment id")?;

        Ok(result.rows_affected() > 0)
    }

    /// 记录已提交的链上调用哈希（状态不变）
    pub async fn set_release_tx(&self, id: Uuid, tx_hash: &str) -> Result<()> {
        sqlx::query(
            "UPDATE payment_intents SET release_tx = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(tx_hash)
        .execute(&self.pool)
        .await
        .context("Failed to record release tx")?;
        Ok(())
    }

    pub async fn set_refund_tx(&self, id: Uuid, tx_hash: &str) -> Result<()> {
        sqlx::query(
            "UPDATE payment_intents SET refund_tx = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(tx_hash)
        .execute(&self.pool)
        .await
        .context("Failed to record refund tx")?;
        Ok(())
    }

    /// 条件状态转换；并发竞争时后到者返回 false
    pub async fn transition(
        &self,
        id: Uuid,
        from: IntentStatus,
        to: IntentStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE payment_intents \
             SET status = $3, updated_at = now() \
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to transition intent status")?;

        Ok(result.rows_affected() > 0)
    }

    /// Deposited 事件：进入 processing 并记录已入金
    pub async fn mark_processing(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE payment_intents \
             SET status = 'processing', deposit_observed = TRUE, updated_at = now() \
             WHERE id = $1 AND status = 'requires_payment'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark intent processing")?;

        Ok(result.rows_affected() > 0)
    }

    /// 合约调用永久失败：从任意非终态进入 failed
    pub async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE payment_intents \
             SET status = 'failed', failure_reason = $2, updated_at = now() \
             WHERE id = $1 AND status IN ('requires_payment', 'processing')",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("Failed to mark intent failed")?;

        Ok(result.rows_affected() > 0)
    }

    /// 重组与已公布的终态冲突：打诊断标记，等待运维对账
    pub async fn flag_reconcile_required(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE payment_intents SET reconcile_required = TRUE, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to flag intent for reconciliation")?;
        Ok(())
    }

    pub async fn set_payout(&self, id: Uuid, payout_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE payment_intents SET payout_id = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(payout_id)
        .execute(&self.pool)
        .await
        .context("Failed to link intent to payout")?;
        Ok(())
    }

    /// 过期扫描：已过 expires_at 的待支付意图
    pub async fn find_expired_awaiting_payment(&self, limit: i64) -> Result<Vec<PaymentIntent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payment_intents \
             WHERE status = 'requires_payment' AND expires_at < now() \
             ORDER BY expires_at ASC LIMIT $1",
            INTENT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query expired intents")?;

        rows.iter().map(intent_from_row).collect()
    }

    /// 自动释放扫描：AUTO 模式、已入金、超过保持窗口
    pub async fn find_auto_release_due(
        &self,
        hold_window_secs: i64,
        limit: i64,
    ) -> Result<Vec<PaymentIntent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payment_intents \
             WHERE status = 'processing' \
               AND release_method = 'auto' \
               AND expires_at + make_interval(secs => $1) < now() \
             ORDER BY expires_at ASC LIMIT $2",
            INTENT_COLUMNS
        ))
        .bind(hold_window_secs as f64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query auto-release candidates")?;

        rows.iter().map(intent_from_row).collect()
    }

    /// 崩溃恢复：带交易哈希但长期停留在非终态的意图
    pub async fn find_stale_inflight(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentIntent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payment_intents \
             WHERE status IN ('requires_payment', 'processing') \
               AND (escrow_creation_tx IS NOT NULL OR release_tx IS NOT NULL OR refund_tx IS NOT NULL) \
               AND updated_at < $1 \
             ORDER BY updated_at ASC LIMIT $2",
            INTENT_COLUMNS
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query in-flight intents")?;

        rows.iter().map(intent_from_row).collect()
    }
}
