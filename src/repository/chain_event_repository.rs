// 链事件摄取簿记：幂等键 + 游标

use anyhow::{Context, Result};

use crate::infrastructure::db::PgPool;

#[derive(Clone)]
pub struct ChainEventRepository {
    pool: PgPool,
}

impl ChainEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 登记 (block_hash, log_index)；主键冲突说明事件已处理过，返回 false
    pub async fn try_record(&self, block_hash: &str, log_index: i64) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO processed_chain_events (block_hash, log_index) \
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(block_hash)
        .bind(log_index)
        .execute(&self.pool)
        .await
        .context("Failed to record processed chain event")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn contains(&self, block_hash: &str, log_index: i64) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM processed_chain_events \
             WHERE block_hash = $1 AND log_index = $2)",
        )
        .bind(block_hash)
        .bind(log_index)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check processed chain event")?;

        Ok(exists)
    }

    /// 最后处理的最终化区块（高度与哈希）
    pub async fn cursor(&self) -> Result<Option<(i64, String)>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT block_number, block_hash FROM ingest_cursor WHERE id = TRUE",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read ingest cursor")?;

        Ok(row)
    }

    pub async fn set_cursor(&self, block_number: i64, block_hash: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingest_cursor (id, block_number, block_hash, updated_at) \
             VALUES (TRUE, $1, $2, now()) \
             ON CONFLICT (id) DO UPDATE SET \
                 block_number = EXCLUDED.block_number, \
                 block_hash = EXCLUDED.block_hash, \
                 updated_at = now()",
        )
        .bind(block_number)
        .bind(block_hash)
        .execute(&self.pool)
        .await
        .context("Failed to advance ingest cursor")?;

        Ok(())
    }
}
