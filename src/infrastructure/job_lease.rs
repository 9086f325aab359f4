//! 定时任务的单飞租约
//! 基于 Postgres advisory lock，同一任务跨实例也只有一个执行者

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::{pool::PoolConnection, Postgres};

use crate::infrastructure::db::PgPool;

/// 任务名映射为 advisory lock 键（跨进程必须稳定，不能用 DefaultHasher）
fn lease_key(job: &str) -> i64 {
    let digest = Sha256::digest(job.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[derive(Clone)]
pub struct JobLeases {
    pool: PgPool,
}

/// 租约守卫：持有专用连接直到释放
pub struct JobLeaseGuard {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
    job: String,
}

impl Drop for JobLeaseGuard {
    fn drop(&mut self) {
        // advisory lock 必须在同一连接上解锁，Drop 里只能异步处理
        if let Some(mut conn) = self.conn.take() {
            let key = self.key;
            let job = std::mem::take(&mut self.job);
            tokio::spawn(async move {
                if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .execute(&mut *conn)
                    .await
                {
                    tracing::warn!(job = %job, error = ?e, "Failed to release job lease");
                }
            });
        }
    }
}

impl JobLeases {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 尝试获取任务租约；已被占用时返回 None（本轮直接跳过）
    pub async fn try_acquire(&self, job: &str) -> Result<Option<JobLeaseGuard>> {
        let key = lease_key(job);
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection for job lease")?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .context("Failed to take advisory lock")?;

        if acquired {
            Ok(Some(JobLeaseGuard {
                conn: Some(conn),
                key,
                job: job.to_string(),
            }))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_keys_are_stable_and_distinct() {
        assert_eq!(lease_key("expire-intents"), lease_key("expire-intents"));
        assert_ne!(lease_key("expire-intents"), lease_key("auto-release"));
        assert_ne!(lease_key("webhook-sweep"), lease_key("payout-batch"));
    }
}
