//! 商户结算领域模型

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Sent,
    Failed,
}

impl PayoutStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PayoutStatus::Pending),
            "sent" => Ok(PayoutStatus::Sent),
            "failed" => Ok(PayoutStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid payout status: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Sent => "sent",
            PayoutStatus::Failed => "failed",
        }
    }
}

/// 聚合结算：一批 SUCCEEDED 意图对应金库到商户钱包的一笔转账
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub intent_ids: Vec<Uuid>,
    pub gross: Decimal,
    pub fee: Decimal,
    pub net: Decimal,
    pub status: PayoutStatus,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
