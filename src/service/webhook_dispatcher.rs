//! Webhook 投递
//! 至少一次语义：事件先落库（PENDING），清扫循环负责投递与退避重试。
//! 接收方必须按事件 id 幂等。

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::{
    config::WebhookConfig,
    domain::{Merchant, PaymentIntent, WebhookDeliveryStatus, WebhookEvent, WebhookEventType},
    metrics,
    repository::{IntentRepository, MerchantRepository, WebhookRepository},
};

type HmacSha256 = Hmac<Sha256>;

const SWEEP_BATCH: i64 = 100;

/// 请求体签名：hex(hmac_sha256(secret, raw_body))
pub fn sign_payload(secret: &str, body: &str) -> Result<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).context("Invalid HMAC key length")?;
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// 指数退避（无抖动部分）：base * 2^(attempt-1)，封顶 cap
pub fn backoff_delay_secs(attempt: i32, base_secs: u64, cap_secs: u64) -> u64 {
    let attempt = attempt.max(1) as u32;
    let exp = base_secs.saturating_mul(1u64 << (attempt - 1).min(32));
    exp.min(cap_secs)
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    webhook_repo: WebhookRepository,
    intent_repo: IntentRepository,
    merchant_repo: MerchantRepository,
    http_client: reqwest::Client,
    config: WebhookConfig,
    delivery_slots: Arc<Semaphore>,
    /// 正在投递中的事件，避免相邻清扫重复拾取
    inflight: Arc<Mutex<HashSet<Uuid>>>,
}

impl WebhookDispatcher {
    pub fn new(
        webhook_repo: WebhookRepository,
        intent_repo: IntentRepository,
        merchant_repo: MerchantRepository,
        config: WebhookConfig,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            webhook_repo,
            intent_repo,
            merchant_repo,
            http_client,
            delivery_slots: Arc::new(Semaphore::new(config.workers)),
            config,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// 持久化一条领域事件并立即返回；投递由清扫循环完成。
    /// 同一意图同一类型重复 emit 是无害的（崩溃后补发会在存储层去重）
    pub async fn emit(
        &self,
        intent: &PaymentIntent,
        event_type: WebhookEventType,
        payload: serde_json::Value,
    ) -> Result<WebhookEvent> {
        let now = Utc::now();
        let event = WebhookEvent {
            id: Uuid::new_v4(),
            intent_id: intent.id,
            event_type,
            payload,
            status: WebhookDeliveryStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_response_code: None,
            delivered_at: None,
            created_at: now,
        };
        let inserted = self.webhook_repo.insert(&event).await?;

        if inserted {
            tracing::debug!(
                event_id = %event.id,
                intent_id = %intent.id,
                event_type = event_type.as_str(),
                "Webhook event enqueued"
            );
        }
        Ok(event)
    }

    /// 单次清扫：取到期事件并并发投递（有界工作池）
    pub async fn sweep(&self) -> Result<usize> {
        let due = self.webhook_repo.find_due(SWEEP_BATCH).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut handles = Vec::new();
        for event in due {
            {
                let mut inflight = match self.inflight.lock() {
                    Ok(set) => set,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if !inflight.insert(event.id) {
                    continue;
                }
            }

            let dispatcher = self.clone();
            let permit = self.delivery_slots.clone().acquire_owned().await?;
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let event_id = event.id;
                if let Err(e) = dispatcher.deliver(event).await {
                    tracing::error!(event_id = %event_id, error = ?e, "Webhook delivery errored");
                }
                let mut inflight = match dispatcher.inflight.lock() {
                    Ok(set) => set,
                    Err(poisoned) => poisoned.into_inner(),
                };
                inflight.remove(&event_id);
            }));
        }

        let count = handles.len();
        futures::future::join_all(handles).await;
        Ok(count)
    }

    /// 投递一次并按结果更新事件状态
    async fn deliver(&self, event: WebhookEvent) -> Result<()> {
        let merchant = self.resolve_merchant(&event).await?;

        let body = serde_json::json!({
            "id": event.id,
            "type": event.event_type.as_str(),
            "created_at": event.created_at.to_rfc3339(),
            "data": event.payload,
        });
        let raw_body = serde_json::to_string(&body).context("Failed to serialize webhook body")?;
        let signature = sign_payload(&merchant.webhook_secret, &raw_body)?;
        let request_id = Uuid::new_v4().to_string();

        let result = self
            .http_client
            .post(&merchant.webhook_url)
            .header("Content-Type", "application/json")
            .header("X-Signature", &signature)
            .header("X-Request-Id", &request_id)
            .body(raw_body)
            .send()
            .await;

        let attempts = event.attempts + 1;
        match result {
            Ok(response) if response.status().is_success() => {
                self.webhook_repo
                    .mark_delivered(event.id, response.status().as_u16() as i32)
                    .await?;
                metrics::inc_webhook_delivered();
                tracing::info!(
                    event_id = %event.id,
                    intent_id = %event.intent_id,
                    event_type = event.event_type.as_str(),
                    attempts = attempts,
                    "Webhook delivered"
                );
            }
            Ok(response) => {
                let code = response.status().as_u16() as i32;
                self.record_failure(&event, attempts, Some(code)).await?;
            }
            Err(e) => {
                // 超时 / DNS / TCP 一律按可重试处理
                tracing::warn!(
                    event_id = %event.id,
                    url = %merchant.webhook_url,
                    attempt = attempts,
                    error = ?e,
                    "Webhook request failed"
                );
                self.record_failure(&event, attempts, None).await?;
            }
        }
        Ok(())
    }

    async fn resolve_merchant(&self, event: &WebhookEvent) -> Result<Merchant> {
        let intent = self
            .intent_repo
            .find_by_id(event.intent_id)
            .await?
            .with_context(|| format!("Intent {} missing for webhook event", event.intent_id))?;
        self.merchant_repo
            .find_by_id(intent.merchant_id)
            .await?
            .with_context(|| format!("Merchant {} missing for webhook event", intent.merchant_id))
    }

    async fn record_failure(
        &self,
        event: &WebhookEvent,
        attempts: i32,
        response_code: Option<i32>,
    ) -> Result<()> {
        metrics::inc_webhook_failed_attempts();

        if attempts >= self.config.max_attempts {
            self.webhook_repo
                .mark_failed(event.id, attempts, response_code)
                .await?;
            metrics::inc_webhook_exhausted();
            tracing::error!(
                event_id = %event.id,
                intent_id = %event.intent_id,
                attempts = attempts,
                response_code = ?response_code,
                "Webhook delivery exhausted retries, marked failed"
            );
            return Ok(());
        }

        let base = backoff_delay_secs(
            attempts,
            self.config.backoff_base_secs,
            self.config.backoff_cap_secs,
        );
        // 抖动：在退避值上再加 0-25%，避免重试风暴
        let jitter = rand::thread_rng().gen_range(0..=base / 4 + 1);
        let next_attempt_at = Utc::now() + chrono::Duration::seconds((base + jitter) as i64);

        self.webhook_repo
            .mark_retrying(event.id, attempts, next_attempt_at, response_code)
            .await?;
        tracing::warn!(
            event_id = %event.id,
            attempts = attempts,
            retry_in_secs = base + jitter,
            response_code = ?response_code,
            "Webhook delivery failed, scheduled retry"
        );
        Ok(())
    }
}
