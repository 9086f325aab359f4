//! Webhook 事件领域模型

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 领域事件类型，与意图状态转换一一对应
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "payment.processing")]
    PaymentProcessing,
    #[serde(rename = "payment.succeeded")]
    PaymentSucceeded,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.canceled")]
    PaymentCanceled,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,
}

impl WebhookEventType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "payment.processing" => Ok(WebhookEventType::PaymentProcessing),
            "payment.succeeded" => Ok(WebhookEventType::PaymentSucceeded),
            "payment.failed" => Ok(WebhookEventType::PaymentFailed),
            "payment.canceled" => Ok(WebhookEventType::PaymentCanceled),
            "payment.refunded" => Ok(WebhookEventType::PaymentRefunded),
            _ => Err(anyhow::anyhow!("Invalid webhook event type: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventType::PaymentProcessing => "payment.processing",
            WebhookEventType::PaymentSucceeded => "payment.succeeded",
            WebhookEventType::PaymentFailed => "payment.failed",
            WebhookEventType::PaymentCanceled => "payment.canceled",
            WebhookEventType::PaymentRefunded => "payment.refunded",
        }
    }
}

/// 投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookDeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Retrying,
}

impl WebhookDeliveryStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(WebhookDeliveryStatus::Pending),
            "delivered" => Ok(WebhookDeliveryStatus::Delivered),
            "failed" => Ok(WebhookDeliveryStatus::Failed),
            "retrying" => Ok(WebhookDeliveryStatus::Retrying),
            _ => Err(anyhow::anyhow!("Invalid webhook delivery status: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookDeliveryStatus::Pending => "pending",
            WebhookDeliveryStatus::Delivered => "delivered",
            WebhookDeliveryStatus::Failed => "failed",
            WebhookDeliveryStatus::Retrying => "retrying",
        }
    }
}

/// 持久化的 Webhook 事件（payload 是发出时刻的意图快照）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub event_type: WebhookEventType,
    pub payload: serde_json::Value,
    pub status: WebhookDeliveryStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_response_code: Option<i32>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&WebhookEventType::PaymentSucceeded).unwrap(),
            "\"payment.succeeded\""
        );
        assert_eq!(
            WebhookEventType::parse("payment.processing").unwrap(),
            WebhookEventType::PaymentProcessing
        );
    }
}
