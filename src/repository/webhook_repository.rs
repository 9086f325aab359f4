// Webhook 事件数据访问 Repository

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;

use crate::{
    domain::{WebhookDeliveryStatus, WebhookEvent, WebhookEventType},
    infrastructure::db::PgPool,
};

const EVENT_COLUMNS: &str = "id, intent_id, event_type, payload, status, attempts, \
     next_attempt_at, last_response_code, delivered_at, created_at";

fn event_from_row(row: &PgRow) -> Result<WebhookEvent> {
    Ok(WebhookEvent {
        id: row.try_get("id")?,
        intent_id: row.try_get("intent_id")?,
        event_type: WebhookEventType::parse(row.try_get::<String, _>("event_type")?.as_str())?,
        payload: row.try_get("payload")?,
        status: WebhookDeliveryStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        attempts: row.try_get("attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_response_code: row.try_get("last_response_code")?,
        delivered_at: row.try_get("delivered_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Clone)]
pub struct WebhookRepository {
    pool: PgPool,
}

impl WebhookRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 落库一条事件；同一意图同一类型只会存在一条（状态转换补发时自然去重）
    pub async fn insert(&self, event: &WebhookEvent) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO webhook_events \
             (id, intent_id, event_type, payload, status, attempts, next_attempt_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (intent_id, event_type) DO NOTHING",
        )
        .bind(event.id)
        .bind(event.intent_id)
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(event.status.as_str())
        .bind(event.attempts)
        .bind(event.next_attempt_at)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert webhook event")?;

        Ok(result.rows_affected() > 0)
    }

    /// 取到期待投递事件：每个意图只取其最早的未投递事件（尽力 FIFO），
    /// 某个意图在退避中不会阻塞其他意图
    pub async fn find_due(&self, limit: i64) -> Result<Vec<WebhookEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ( \
                 SELECT DISTINCT ON (intent_id) {} \
                 FROM webhook_events \
                 WHERE status IN ('pending', 'retrying') \
                 ORDER BY intent_id, created_at ASC \
             ) oldest \
             WHERE next_attempt_at <= now() \
             ORDER BY next_attempt_at ASC \
             LIMIT $1",
            EVENT_COLUMNS, EVENT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query due webhook events")?;

        rows.iter().map(event_from_row).collect()
    }

    pub async fn mark_delivered(&self, id: Uuid, response_code: i32) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_events \
             SET status = 'delivered', last_response_code = $2, delivered_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(response_code)
        .execute(&self.pool)
        .await
        .context("Failed to mark webhook delivered")?;
        Ok(())
    }

    pub async fn mark_retrying(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        response_code: Option<i32>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_events \
             SET status = 'retrying', attempts = $2, next_attempt_at = $3, \
                 last_response_code = $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(response_code)
        .execute(&self.pool)
        .await
        .context("Failed to mark webhook retrying")?;
        Ok(())
    }

    /// 重试次数耗尽：终态 failed，可由运维手动重放
    pub async fn mark_failed(
        &self,
        id: Uuid,
        attempts: i32,
        response_code: Option<i32>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_events \
             SET status = 'failed', attempts = $2, last_response_code = $3 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(attempts)
        .bind(response_code)
        .execute(&self.pool)
        .await
        .context("Failed to mark webhook failed")?;
        Ok(())
    }

    pub async fn find_for_intent(&self, intent_id: Uuid) -> Result<Vec<WebhookEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM webhook_events WHERE intent_id = $1 ORDER BY created_at ASC",
            EVENT_COLUMNS
        ))
        .bind(intent_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query webhook events for intent")?;

        rows.iter().map(event_from_row).collect()
    }
}
