//! 商户领域模型（对核心只读）

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 结算周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutSchedule {
    Manual,
    Daily,
    Weekly,
}

impl PayoutSchedule {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(PayoutSchedule::Manual),
            "daily" => Ok(PayoutSchedule::Daily),
            "weekly" => Ok(PayoutSchedule::Weekly),
            _ => Err(anyhow::anyhow!("Invalid payout schedule: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutSchedule::Manual => "manual",
            PayoutSchedule::Daily => "daily",
            PayoutSchedule::Weekly => "weekly",
        }
    }

    /// 两次批量结算之间的最小间隔（Manual 不参与定时结算）
    pub fn interval(&self) -> Option<chrono::Duration> {
        match self {
            PayoutSchedule::Manual => None,
            PayoutSchedule::Daily => Some(chrono::Duration::days(1)),
            PayoutSchedule::Weekly => Some(chrono::Duration::days(7)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Merchant {
    pub id: Uuid,
    /// 结算目标地址
    pub wallet_address: String,
    pub webhook_url: String,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    /// 平台费（基点，0-10000）
    pub platform_fee_bps: i32,
    pub payout_schedule: PayoutSchedule,
    pub min_payout_amount: Decimal,
    pub is_active: bool,
    pub last_payout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_intervals() {
        assert!(PayoutSchedule::Manual.interval().is_none());
        assert_eq!(
            PayoutSchedule::Daily.interval().unwrap(),
            chrono::Duration::days(1)
        );
        assert_eq!(
            PayoutSchedule::Weekly.interval().unwrap(),
            chrono::Duration::days(7)
        );
    }
}
