//! 支付意图领域模型
//!
//! 状态机规则集中在这里：所有组件通过 `IntentStatus::can_transition_to`
//! 判断转换是否合法，IntentEngine 是唯一的状态写入方。

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 链上原生精度（DOT/KSM 在 EVM 兼容链上按 18 位小数表示）
pub const CHAIN_DECIMALS: u32 = 18;

/// 法币金额上限（最小单位）
pub const MAX_FIAT_MINOR: i64 = 99_999_999;

/// 支付意图状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPayment,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    Expired,
    Refunded,
}

impl IntentStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "requires_payment" => Ok(IntentStatus::RequiresPayment),
            "processing" => Ok(IntentStatus::Processing),
            "succeeded" => Ok(IntentStatus::Succeeded),
            "failed" => Ok(IntentStatus::Failed),
            "canceled" => Ok(IntentStatus::Canceled),
            "expired" => Ok(IntentStatus::Expired),
            "refunded" => Ok(IntentStatus::Refunded),
            _ => Err(anyhow::anyhow!("Invalid intent status: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::RequiresPayment => "requires_payment",
            IntentStatus::Processing => "processing",
            IntentStatus::Succeeded => "succeeded",
            IntentStatus::Failed => "failed",
            IntentStatus::Canceled => "canceled",
            IntentStatus::Expired => "expired",
            IntentStatus::Refunded => "refunded",
        }
    }

    /// 判断是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Succeeded
                | IntentStatus::Failed
                | IntentStatus::Canceled
                | IntentStatus::Expired
                | IntentStatus::Refunded
        )
    }

    /// 状态转换规则
    ///
    /// ```text
    /// RequiresPayment -> Processing | Canceled | Expired | Failed
    /// Processing      -> Succeeded | Refunded | Failed
    /// 终态不允许任何转出
    /// ```
    ///
    /// Failed 只能从非终态进入（合约调用永久失败）。
    pub fn can_transition_to(&self, to: IntentStatus) -> bool {
        match self {
            IntentStatus::RequiresPayment => matches!(
                to,
                IntentStatus::Processing
                    | IntentStatus::Canceled
                    | IntentStatus::Expired
                    | IntentStatus::Failed
            ),
            IntentStatus::Processing => matches!(
                to,
                IntentStatus::Succeeded | IntentStatus::Refunded | IntentStatus::Failed
            ),
            IntentStatus::Succeeded
            | IntentStatus::Failed
            | IntentStatus::Canceled
            | IntentStatus::Expired
            | IntentStatus::Refunded => false,
        }
    }
}

/// 法币币种
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FiatCurrency {
    Usd,
    Eur,
    Gbp,
    Jpy,
}

impl FiatCurrency {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "usd" => Ok(FiatCurrency::Usd),
            "eur" => Ok(FiatCurrency::Eur),
            "gbp" => Ok(FiatCurrency::Gbp),
            "jpy" => Ok(FiatCurrency::Jpy),
            _ => Err(anyhow::anyhow!("Unsupported fiat currency: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FiatCurrency::Usd => "usd",
            FiatCurrency::Eur => "eur",
            FiatCurrency::Gbp => "gbp",
            FiatCurrency::Jpy => "jpy",
        }
    }

    /// 最小单位指数（JPY 无小数位）
    pub fn exponent(&self) -> u32 {
        match self {
            FiatCurrency::Jpy => 0,
            _ => 2,
        }
    }

    /// 最小单位金额换算为主单位 Decimal
    pub fn minor_to_major(&self, minor: i64) -> Decimal {
        Decimal::new(minor, self.exponent())
    }
}

/// 加密币种（单链部署：DOT 或 KSM）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoCurrency {
    Dot,
    Ksm,
}

impl CryptoCurrency {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dot" => Ok(CryptoCurrency::Dot),
            "ksm" => Ok(CryptoCurrency::Ksm),
            _ => Err(anyhow::anyhow!("Unsupported crypto currency: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CryptoCurrency::Dot => "dot",
            CryptoCurrency::Ksm => "ksm",
        }
    }
}

/// 释放方式：到期后自动释放或商户手动确认
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseMethod {
    Auto,
    Manual,
}

impl ReleaseMethod {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(ReleaseMethod::Auto),
            "manual" => Ok(ReleaseMethod::Manual),
            _ => Err(anyhow::anyhow!("Invalid release method: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseMethod::Auto => "auto",
            ReleaseMethod::Manual => "manual",
        }
    }
}

/// 支付意图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub fiat_amount: i64,
    pub fiat_currency: FiatCurrency,
    pub crypto_amount: Decimal,
    pub crypto_currency: CryptoCurrency,
    pub quote_rate: Decimal,
    pub quote_taken_at: DateTime<Utc>,
    pub status: IntentStatus,
    pub escrow_payment_id: Option<i64>,
    pub escrow_creation_tx: Option<String>,
    pub release_tx: Option<String>,
    pub refund_tx: Option<String>,
    pub deposit_address: String,
    pub expires_at: DateTime<Utc>,
    pub release_method: ReleaseMethod,
    /// 是否已观测到买家入金（Deposited 事件）
    pub deposit_observed: bool,
    pub failure_reason: Option<String>,
    /// 重组与终态决定冲突时的诊断标记，需要运维介入
    pub reconcile_required: bool,
    pub payout_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    /// 对外快照：API 响应与 webhook payload 共用同一形状
    /// 金额类字段序列化为字符串，避免消费端丢精度
    pub fn api_view(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "merchant_id": self.merchant_id,
            "fiat_amount": self.fiat_amount,
            "fiat_currency": self.fiat_currency.as_str(),
            "crypto_amount": format!("{:.18}", self.crypto_amount),
            "crypto_currency": self.crypto_currency.as_str(),
            "quote_rate": self.quote_rate.to_string(),
            "quote_taken_at": self.quote_taken_at.to_rfc3339(),
            "status": self.status.as_str(),
            "escrow_payment_id": self.escrow_payment_id,
            "escrow_creation_tx": self.escrow_creation_tx,
            "release_tx": self.release_tx,
            "refund_tx": self.refund_tx,
            "deposit_address": self.deposit_address,
            "expires_at": self.expires_at.to_rfc3339(),
            "release_method": self.release_method.as_str(),
            "failure_reason": self.failure_reason,
            "metadata": self.metadata,
            "created_at": self.created_at.to_rfc3339(),
            "updated_at": self.updated_at.to_rfc3339(),
        })
    }
}

/// 报价换算：法币最小单位 / 汇率 -> 链上原生数量，截断到链精度
pub fn quote_crypto_amount(
    fiat_amount: i64,
    fiat_currency: FiatCurrency,
    rate: Decimal,
) -> Result<Decimal> {
    if rate <= Decimal::ZERO {
        anyhow::bail!("Quote rate must be positive, got {}", rate);
    }
    let major = fiat_currency.minor_to_major(fiat_amount);
    let crypto = major
        .checked_div(rate)
        .ok_or_else(|| anyhow::anyhow!("Quote division overflow: {} / {}", major, rate))?;
    Ok(crypto.trunc_with_scale(CHAIN_DECIMALS))
}

/// 金额校验：1 最小单位 … 99,999,999；JPY 仅整数（最小单位即整数円）
pub fn validate_fiat_amount(fiat_amount: i64) -> Result<()> {
    if fiat_amount < 1 || fiat_amount > MAX_FIAT_MINOR {
        anyhow::bail!(
            "Fiat amount out of range: {} (allowed 1..={})",
            fiat_amount,
            MAX_FIAT_MINOR
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        let all = [
            IntentStatus::RequiresPayment,
            IntentStatus::Processing,
            IntentStatus::Succeeded,
            IntentStatus::Failed,
            IntentStatus::Canceled,
            IntentStatus::Expired,
            IntentStatus::Refunded,
        ];
        for from in all {
            if from.is_terminal() {
                for to in all {
                    assert!(
                        !from.can_transition_to(to),
                        "{:?} -> {:?} must be rejected",
                        from,
                        to
                    );
                }
            }
        }
    }

    #[test]
    fn dag_edges_match_lifecycle() {
        use IntentStatus::*;
        assert!(RequiresPayment.can_transition_to(Processing));
        assert!(RequiresPayment.can_transition_to(Canceled));
        assert!(RequiresPayment.can_transition_to(Expired));
        assert!(Processing.can_transition_to(Succeeded));
        assert!(Processing.can_transition_to(Refunded));
        assert!(Processing.can_transition_to(Failed));

        assert!(!RequiresPayment.can_transition_to(Succeeded));
        assert!(!RequiresPayment.can_transition_to(Refunded));
        assert!(!Processing.can_transition_to(Canceled));
        assert!(!Processing.can_transition_to(Expired));
    }

    #[test]
    fn quote_truncates_to_chain_precision() {
        // 100.00 USD @ 5.00 USD/DOT = 20 DOT
        let amount = quote_crypto_amount(10_000, FiatCurrency::Usd, dec("5.00")).unwrap();
        assert_eq!(amount, dec("20"));
        assert_eq!(amount.to_string(), "20");

        // 循环小数被截断而不是四舍五入
        let amount = quote_crypto_amount(10_000, FiatCurrency::Usd, dec("3.00")).unwrap();
        assert_eq!(amount.to_string(), "33.333333333333333333");
    }

    #[test]
    fn quote_round_trips_to_fiat_precision() {
        // crypto_amount * rate 四舍五入回法币精度应等于原始金额
        for (minor, rate) in [
            (10_000i64, dec("5.00")),
            (9_999, dec("7.31")),
            (1, dec("42.17")),
        ] {
            let crypto = quote_crypto_amount(minor, FiatCurrency::Usd, rate).unwrap();
            let back = (crypto * rate).round_dp(2);
            assert_eq!(back, FiatCurrency::Usd.minor_to_major(minor));
        }
    }

    #[test]
    fn jpy_has_no_minor_units() {
        assert_eq!(FiatCurrency::Jpy.exponent(), 0);
        assert_eq!(FiatCurrency::Jpy.minor_to_major(5000).to_string(), "5000");
    }

    #[test]
    fn rejects_zero_and_negative_rates() {
        assert!(quote_crypto_amount(100, FiatCurrency::Usd, Decimal::ZERO).is_err());
        assert!(quote_crypto_amount(100, FiatCurrency::Usd, dec("-1")).is_err());
    }

    #[test]
    fn amount_bounds() {
        assert!(validate_fiat_amount(0).is_err());
        assert!(validate_fiat_amount(1).is_ok());
        assert!(validate_fiat_amount(MAX_FIAT_MINOR).is_ok());
        assert!(validate_fiat_amount(MAX_FIAT_MINOR + 1).is_err());
    }

    #[test]
    fn api_view_renders_full_chain_precision() {
        let now = chrono::Utc::now();
        let intent = PaymentIntent {
            id: Uuid::new_v4(),
            merchant_id: Uuid::new_v4(),
            fiat_amount: 10_000,
            fiat_currency: FiatCurrency::Usd,
            crypto_amount: dec("20"),
            crypto_currency: CryptoCurrency::Dot,
            quote_rate: dec("5.00"),
            quote_taken_at: now,
            status: IntentStatus::RequiresPayment,
            escrow_payment_id: None,
            escrow_creation_tx: Some("0xabc".to_string()),
            release_tx: None,
            refund_tx: None,
            deposit_address: "0x1234".to_string(),
            expires_at: now + chrono::Duration::minutes(5),
            release_method: ReleaseMethod::Manual,
            deposit_observed: false,
            failure_reason: None,
            reconcile_required: false,
            payout_id: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        let view = intent.api_view();
        assert_eq!(view["crypto_amount"], "20.000000000000000000");
        assert_eq!(view["status"], "requires_payment");
        assert_eq!(view["fiat_currency"], "usd");
    }

    #[test]
    fn status_string_round_trip() {
        for s in [
            IntentStatus::RequiresPayment,
            IntentStatus::Processing,
            IntentStatus::Succeeded,
            IntentStatus::Failed,
            IntentStatus::Canceled,
            IntentStatus::Expired,
            IntentStatus::Refunded,
        ] {
            assert_eq!(IntentStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(IntentStatus::parse("pending").is_err());
    }
}
