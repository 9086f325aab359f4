//! 支付意图生命周期引擎
//!
//! 意图状态的唯一写入方。API、链事件摄取、调度器都经由这里驱动转换；
//! 同一意图的变更经过进程内锁串行化，链上调用只提交不等待最终性，
//! 最终性由 EventIngestor 以事件形式送回。

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
    domain::{
        self, CryptoCurrency, FiatCurrency, IntentStatus, PaymentIntent, ReleaseMethod,
        WebhookEventType,
    },
    error::AppError,
    infrastructure::intent_lock::IntentLockMap,
    metrics,
    repository::{IntentRepository, MerchantRepository, PayoutRepository},
    service::{
        chain_client::{decimal_to_native, ChainClient, ChainError, EscrowEvent, ObservedEvent},
        price_service::PriceService,
        webhook_dispatcher::WebhookDispatcher,
    },
};

/// 引擎的类型化错误；对外错误码的唯一翻译点
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("merchant not found")]
    MerchantNotFound,
    #[error("payment intent not found")]
    IntentNotFound,
    #[error("operation '{op}' is not valid while intent is {status:?}")]
    InvalidState {
        op: &'static str,
        status: IntentStatus,
    },
    #[error("price unavailable: {0}")]
    PriceUnavailable(String),
    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match &err {
            EngineError::MerchantNotFound => AppError::merchant_not_found(err.to_string()),
            EngineError::IntentNotFound => AppError::not_found(err.to_string()),
            EngineError::InvalidState { .. } => AppError::invalid_state(err.to_string()),
            EngineError::PriceUnavailable(_) => AppError::price_unavailable(err.to_string()),
            EngineError::ChainUnavailable(_) => AppError::chain_unavailable(err.to_string()),
            EngineError::Validation(_) => AppError::validation(err.to_string()),
            EngineError::Internal(_) => AppError::internal(err.to_string()),
        }
    }
}

/// 创建意图的入参（Surface 已完成结构校验，这里做业务校验）
#[derive(Debug, Clone)]
pub struct CreateIntentParams {
    pub fiat_amount: i64,
    pub fiat_currency: String,
    pub crypto_currency: String,
    pub release_method: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// 链事件的应用结果，摄取端据此簿记
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// 已应用（或确认为安全的重复投递）
    Applied,
    /// 引用了尚未见过的 escrow_payment_id，等创建事件落地后重放
    Deferred,
    /// 与任何意图无关（同一合约上别的租户 / 过期的外部事件）
    Ignored,
}

pub struct IntentEngine {
    intents: IntentRepository,
    merchants: MerchantRepository,
    payouts: PayoutRepository,
    price: Arc<PriceService>,
    chain: Arc<dyn ChainClient>,
    webhooks: Arc<WebhookDispatcher>,
    locks: IntentLockMap,
    hold_window: chrono::Duration,
}

/// 平台费拆分：fee = gross * bps / 10000（截断到链精度），net = gross - fee
pub fn split_fee(gross: Decimal, fee_bps: i32) -> (Decimal, Decimal) {
    let fee = (gross * Decimal::from(fee_bps) / Decimal::from(10_000))
        .trunc_with_scale(domain::intent::CHAIN_DECIMALS);
    (fee, gross - fee)
}

impl IntentEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        intents: IntentRepository,
        merchants: MerchantRepository,
        payouts: PayoutRepository,
        price: Arc<PriceService>,
        chain: Arc<dyn ChainClient>,
        webhooks: Arc<WebhookDispatcher>,
        hold_window_secs: i64,
    ) -> Self {
        Self {
            intents,
            merchants,
            payouts,
            price,
            chain,
            webhooks,
            locks: IntentLockMap::new(),
            hold_window: chrono::Duration::seconds(hold_window_secs),
        }
    }

    // ============ API 驱动的操作 ============

    /// 创建意图：报价 -> 提交 createPayment -> 落库 REQUIRES_PAYMENT
    /// 合约分配的 escrow_payment_id 由 PaymentCreated 事件回填
    pub async fn create(
        &self,
        merchant_id: Uuid,
        params: CreateIntentParams,
    ) -> Result<PaymentIntent, EngineError> {
        let merchant = self
            .merchants
            .find_by_id(merchant_id)
            .await?
            .ok_or(EngineError::MerchantNotFound)?;

        let fiat_currency = FiatCurrency::parse(&params.fiat_currency)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        let crypto_currency = CryptoCurrency::parse(&params.crypto_currency)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        domain::intent::validate_fiat_amount(params.fiat_amount)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        let release_method = match params.release_method.as_deref() {
            Some(raw) => ReleaseMethod::parse(raw)
                .map_err(|e| EngineError::Validation(e.to_string()))?,
            None => ReleaseMethod::Manual,
        };

        let quote = self
            .price
            .rate(fiat_currency, crypto_currency)
            .await
            .map_err(|e| EngineError::PriceUnavailable(format!("{:#}", e)))?;

        let crypto_amount =
            domain::intent::quote_crypto_amount(params.fiat_amount, fiat_currency, quote.rate)
                .map_err(|e| EngineError::Validation(e.to_string()))?;
        let native_amount = decimal_to_native(crypto_amount)
            .context("Quoted amount does not fit native units")?;

        // fire-and-confirm：提交后即返回，不在锁内等待上链
        let creation_tx = match self
            .chain
            .create_payment(
                &merchant.wallet_address,
                native_amount,
                merchant.platform_fee_bps as u16,
            )
            .await
        {
            Ok(tx) => tx,
            Err(ChainError::Reverted(reason)) => {
                // 创建阶段的回滚意味着参数被合约拒绝，没有任何意图落库
                return Err(EngineError::Validation(format!(
                    "Escrow contract rejected createPayment: {}",
                    reason
                )));
            }
            Err(ChainError::Unavailable(reason)) => {
                return Err(EngineError::ChainUnavailable(reason));
            }
        };

        let now = Utc::now();
        let intent = PaymentIntent {
            id: Uuid::new_v4(),
            merchant_id,
            fiat_amount: params.fiat_amount,
            fiat_currency,
            crypto_amount,
            crypto_currency,
            quote_rate: quote.rate,
            quote_taken_at: quote.taken_at,
            status: IntentStatus::RequiresPayment,
            escrow_payment_id: None,
            escrow_creation_tx: Some(creation_tx.clone()),
            release_tx: None,
            refund_tx: None,
            deposit_address: self.chain.escrow_address().to_string(),
            expires_at: now + self.hold_window,
            release_method,
            deposit_observed: false,
            failure_reason: None,
            reconcile_required: false,
            payout_id: None,
            metadata: params.metadata.unwrap_or_else(|| serde_json::json!({})),
            created_at: now,
            updated_at: now,
        };
        self.intents.insert(&intent).await?;
        metrics::inc_intents_created();

        tracing::info!(
            intent_id = %intent.id,
            merchant_id = %merchant_id,
            fiat_amount = intent.fiat_amount,
            fiat_currency = fiat_currency.as_str(),
            crypto_amount = %crypto_amount,
            creation_tx = %creation_tx,
            "Payment intent created"
        );
        Ok(intent)
    }

    /// 商户手动释放；只在 PROCESSING 合法，SUCCEEDED 等 PaymentReleased 事件
    pub async fn confirm(
        &self,
        merchant_id: Uuid,
        intent_id: Uuid,
    ) -> Result<PaymentIntent, EngineError> {
        let _guard = self.locks.acquire(intent_id).await;

        let intent = self
            .intents
            .find_for_merchant(merchant_id, intent_id)
            .await?
            .ok_or(EngineError::IntentNotFound)?;

        if intent.status != IntentStatus::Processing {
            return Err(EngineError::InvalidState {
                op: "confirm",
                status: intent.status,
            });
        }
        if intent.release_tx.is_some() {
            // 释放已在途：并发 Confirm 只允许一笔链上 release
            return Err(EngineError::InvalidState {
                op: "confirm",
                status: intent.status,
            });
        }

        self.submit_release(&intent, "confirm").await?;
        self.reload(intent_id).await
    }

    /// 商户退款；只在 PROCESSING 合法，REFUNDED 等 PaymentRefunded 事件
    pub async fn refund(
        &self,
        merchant_id: Uuid,
        intent_id: Uuid,
    ) -> Result<PaymentIntent, EngineError> {
        let _guard = self.locks.acquire(intent_id).await;

        let intent = self
            .intents
            .find_for_merchant(merchant_id, intent_id)
            .await?
            .ok_or(EngineError::IntentNotFound)?;

        if intent.status != IntentStatus::Processing {
            return Err(EngineError::InvalidState {
                op: "refund",
                status: intent.status,
            });
        }
        if intent.refund_tx.is_some() {
            return Err(EngineError::InvalidState {
                op: "refund",
                status: intent.status,
            });
        }

        let payment_id = intent
            .escrow_payment_id
            .context("Processing intent is missing escrow_payment_id")?;

        match self.chain.refund(payment_id).await {
            Ok(tx_hash) => {
                self.intents.set_refund_tx(intent_id, &tx_hash).await?;
                tracing::info!(intent_id = %intent_id, tx_hash = %tx_hash, "Refund submitted");
            }
            Err(ChainError::Reverted(reason)) => {
                self.fail_intent(&intent, &reason).await?;
            }
            Err(ChainError::Unavailable(reason)) => {
                return Err(EngineError::ChainUnavailable(reason));
            }
        }
        self.reload(intent_id).await
    }

    /// 取消；只在 REQUIRES_PAYMENT 且未观测到入金时合法。
    /// 托管位已在链上创建时走合约 cancel（CANCELED 等事件），
    /// 否则直接落 CANCELED。
    pub async fn cancel(
        &self,
        merchant_id: Uuid,
        intent_id: Uuid,
    ) -> Result<PaymentIntent, EngineError> {
        let _guard = self.locks.acquire(intent_id).await;

        let intent = self
            .intents
            .find_for_merchant(merchant_id, intent_id)
            .await?
            .ok_or(EngineError::IntentNotFound)?;

        if intent.status != IntentStatus::RequiresPayment || intent.deposit_observed {
            return Err(EngineError::InvalidState {
                op: "cancel",
                status: intent.status,
            });
        }

        match intent.escrow_payment_id {
            Some(payment_id) => match self.chain.cancel(payment_id).await {
                Ok(tx_hash) => {
                    tracing::info!(
                        intent_id = %intent_id,
                        payment_id = payment_id,
                        tx_hash = %tx_hash,
                        "Escrow cancel submitted"
                    );
                }
                Err(ChainError::Reverted(reason)) => {
                    self.fail_intent(&intent, &reason).await?;
                }
                Err(ChainError::Unavailable(reason)) => {
                    return Err(EngineError::ChainUnavailable(reason));
                }
            },
            None => {
                // 链上还没有托管位，本地直接终结
                self.apply_transition(&intent, IntentStatus::Canceled).await?;
                self.emit_snapshot(intent_id, WebhookEventType::PaymentCanceled)
                    .await?;
            }
        }
        self.reload(intent_id).await
    }

    // ============ 调度器驱动的操作 ============

    /// 过期处理。未入金：链上 cancel（或无托管位时直接 EXPIRED）；
    /// 晚到入金：留给 Deposited 事件与自动释放路径
    pub async fn expire(&self, intent_id: Uuid) -> Result<()> {
        let _guard = self.locks.acquire(intent_id).await;

        let Some(intent) = self.intents.find_by_id(intent_id).await? else {
            return Ok(());
        };
        if intent.status != IntentStatus::RequiresPayment || Utc::now() <= intent.expires_at {
            return Ok(());
        }

        match intent.escrow_payment_id {
            Some(payment_id) => {
                let funded = match self.chain.deposited_amount(payment_id).await {
                    Ok(amount) => amount > 0,
                    Err(e) => {
                        // 链不可用时跳过本轮，不推进状态
                        tracing::warn!(
                            intent_id = %intent_id,
                            error = %e,
                            "Cannot read escrow funding state, skipping expiration"
                        );
                        return Ok(());
                    }
                };

                if funded {
                    // 晚到的入金：等 Deposited 事件进 PROCESSING，再按释放策略走
                    tracing::info!(
                        intent_id = %intent_id,
                        payment_id = payment_id,
                        "Expired intent is funded on chain, deferring to deposit handling"
                    );
                    return Ok(());
                }

                match self.chain.cancel(payment_id).await {
                    Ok(tx_hash) => {
                        tracing::info!(
                            intent_id = %intent_id,
                            payment_id = payment_id,
                            tx_hash = %tx_hash,
                            "Expired escrow cancel submitted"
                        );
                    }
                    Err(ChainError::Reverted(reason)) => {
                        self.fail_intent(&intent, &reason).await?;
                    }
                    Err(ChainError::Unavailable(reason)) => {
                        tracing::warn!(
                            intent_id = %intent_id,
                            reason = %reason,
                            "Chain unavailable during expiration, will retry next tick"
                        );
                    }
                }
            }
            None => {
                // 托管位从未上链，没什么可取消的
                self.apply_transition(&intent, IntentStatus::Expired).await?;
                tracing::info!(intent_id = %intent_id, "Intent expired without escrow");
            }
        }
        Ok(())
    }

    /// 自动释放：AUTO 模式、已过保持窗口的 PROCESSING 意图
    pub async fn auto_release(&self, intent_id: Uuid) -> Result<()> {
        let _guard = self.locks.acquire(intent_id).await;

        let Some(intent) = self.intents.find_by_id(intent_id).await? else {
            return Ok(());
        };
        if intent.status != IntentStatus::Processing
            || intent.release_method != ReleaseMethod::Auto
            || intent.release_tx.is_some()
        {
            return Ok(());
        }

        if let Err(e) = self.submit_release(&intent, "auto-release").await {
            match e {
                EngineError::ChainUnavailable(reason) => {
                    tracing::warn!(
                        intent_id = %intent_id,
                        reason = %reason,
                        "Chain unavailable during auto-release, will retry next tick"
                    );
                }
                other => return Err(other.into()),
            }
        }
        Ok(())
    }

    // ============ 链事件回调 ============

    /// EventIngestor 的唯一入口；幂等键判重由摄取端完成，
    /// 这里的状态条件再挡一层重复/乱序
    pub async fn on_chain_event(&self, observed: &ObservedEvent) -> Result<ApplyOutcome> {
        match &observed.event {
            EscrowEvent::PaymentCreated { payment_id, .. } => {
                self.handle_payment_created(observed, *payment_id).await
            }
            EscrowEvent::Deposited { payment_id, .. } => {
                self.handle_deposited(*payment_id).await
            }
            EscrowEvent::PaymentReleased { payment_id, .. } => {
                self.handle_released(observed, *payment_id).await
            }
            EscrowEvent::PaymentRefunded { payment_id, .. } => {
                self.handle_refunded(observed, *payment_id).await
            }
            EscrowEvent::PaymentCanceled { payment_id } => {
                self.handle_canceled(*payment_id).await
            }
        }
    }

    async fn handle_payment_created(
        &self,
        observed: &ObservedEvent,
        payment_id: i64,
    ) -> Result<ApplyOutcome> {
        let Some(intent) = self
            .intents
            .find_by_escrow_creation_tx(&observed.tx_hash)
            .await?
        else {
            // 同一合约上其他集成方创建的托管位
            return Ok(ApplyOutcome::Ignored);
        };

        let _guard = self.locks.acquire(intent.id).await;
        let backfilled = self.intents.set_escrow_payment_id(intent.id, payment_id).await?;
        if backfilled {
            tracing::info!(
                intent_id = %intent.id,
                payment_id = payment_id,
                "Escrow payment id backfilled"
            );
        } else if intent.escrow_payment_id != Some(payment_id) {
            tracing::error!(
                intent_id = %intent.id,
                existing = ?intent.escrow_payment_id,
                incoming = payment_id,
                "PaymentCreated conflicts with recorded escrow payment id"
            );
            self.intents.flag_reconcile_required(intent.id).await?;
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn handle_deposited(&self, payment_id: i64) -> Result<ApplyOutcome> {
        let Some(intent) = self.intents.find_by_escrow_payment_id(payment_id).await? else {
            return Ok(ApplyOutcome::Deferred);
        };

        let _guard = self.locks.acquire(intent.id).await;
        let moved = self.intents.mark_processing(intent.id).await?;
        if moved {
            metrics::inc_intent_transitions();
            self.emit_snapshot(intent.id, WebhookEventType::PaymentProcessing)
                .await?;
            tracing::info!(
                intent_id = %intent.id,
                payment_id = payment_id,
                "Deposit observed, intent processing"
            );
        } else if self.current_status(intent.id).await? == Some(IntentStatus::Processing) {
            // 转换早已发生：补发只会命中存储层的去重
            self.emit_snapshot(intent.id, WebhookEventType::PaymentProcessing)
                .await?;
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn handle_released(
        &self,
        observed: &ObservedEvent,
        payment_id: i64,
    ) -> Result<ApplyOutcome> {
        let Some(intent) = self.intents.find_by_escrow_payment_id(payment_id).await? else {
            return Ok(ApplyOutcome::Deferred);
        };

        let _guard = self.locks.acquire(intent.id).await;
        match intent.status {
            IntentStatus::Processing => {
                if intent.release_tx.is_none() {
                    self.intents.set_release_tx(intent.id, &observed.tx_hash).await?;
                }
                self.apply_transition(&intent, IntentStatus::Succeeded).await?;
                self.emit_snapshot(intent.id, WebhookEventType::PaymentSucceeded)
                    .await?;
                self.link_payout(&intent).await?;
                tracing::info!(
                    intent_id = %intent.id,
                    payment_id = payment_id,
                    release_tx = %observed.tx_hash,
                    "Escrow released, intent succeeded"
                );
            }
            IntentStatus::Succeeded => {
                // 重放的旧事件；补发 webhook（存储层去重）以修复中断的发射
                self.emit_snapshot(intent.id, WebhookEventType::PaymentSucceeded)
                    .await?;
            }
            other => {
                tracing::error!(
                    intent_id = %intent.id,
                    status = other.as_str(),
                    "PaymentReleased observed in incompatible status"
                );
                self.intents.flag_reconcile_required(intent.id).await?;
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn handle_refunded(
        &self,
        observed: &ObservedEvent,
        payment_id: i64,
    ) -> Result<ApplyOutcome> {
        let Some(intent) = self.intents.find_by_escrow_payment_id(payment_id).await? else {
            return Ok(ApplyOutcome::Deferred);
        };

        let _guard = self.locks.acquire(intent.id).await;
        match intent.status {
            IntentStatus::Processing => {
                if intent.refund_tx.is_none() {
                    self.intents.set_refund_tx(intent.id, &observed.tx_hash).await?;
                }
                self.apply_transition(&intent, IntentStatus::Refunded).await?;
                self.emit_snapshot(intent.id, WebhookEventType::PaymentRefunded)
                    .await?;
                tracing::info!(
                    intent_id = %intent.id,
                    payment_id = payment_id,
                    refund_tx = %observed.tx_hash,
                    "Escrow refunded"
                );
            }
            IntentStatus::RequiresPayment => {
                // 未入金时的合约退款等价于取消
                self.apply_transition(&intent, IntentStatus::Canceled).await?;
                self.emit_snapshot(intent.id, WebhookEventType::PaymentCanceled)
                    .await?;
            }
            IntentStatus::Refunded => {
                self.emit_snapshot(intent.id, WebhookEventType::PaymentRefunded)
                    .await?;
            }
            IntentStatus::Canceled => {
                self.emit_snapshot(intent.id, WebhookEventType::PaymentCanceled)
                    .await?;
            }
            other => {
                tracing::error!(
                    intent_id = %intent.id,
                    status = other.as_str(),
                    "PaymentRefunded observed in incompatible status"
                );
                self.intents.flag_reconcile_required(intent.id).await?;
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn handle_canceled(&self, payment_id: i64) -> Result<ApplyOutcome> {
        let Some(intent) = self.intents.find_by_escrow_payment_id(payment_id).await? else {
            return Ok(ApplyOutcome::Deferred);
        };

        let _guard = self.locks.acquire(intent.id).await;
        match intent.status {
            IntentStatus::RequiresPayment => {
                self.apply_transition(&intent, IntentStatus::Canceled).await?;
                self.emit_snapshot(intent.id, WebhookEventType::PaymentCanceled)
                    .await?;
                tracing::info!(intent_id = %intent.id, "Escrow canceled on chain");
            }
            IntentStatus::Canceled => {
                self.emit_snapshot(intent.id, WebhookEventType::PaymentCanceled)
                    .await?;
            }
            // 本地已判定过期，链上取消事件只是迟到的确认
            IntentStatus::Expired => {}
            other => {
                tracing::error!(
                    intent_id = %intent.id,
                    status = other.as_str(),
                    "PaymentCanceled observed in incompatible status"
                );
                self.intents.flag_reconcile_required(intent.id).await?;
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    // ============ 崩溃恢复 ============

    /// 启动对账：长期停留在非终态、带交易哈希的意图，重读链上回执。
    /// 已打包但执行失败的交易按永久失败落 FAILED。
    pub async fn reconcile_inflight(&self, older_than_secs: i64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than_secs);
        let stale = self.intents.find_stale_inflight(cutoff, 200).await?;
        let mut reconciled = 0usize;

        for intent in stale {
            let tx_hash = intent
                .release_tx
                .as_deref()
                .or(intent.refund_tx.as_deref())
                .or(intent.escrow_creation_tx.as_deref());
            let Some(tx_hash) = tx_hash else { continue };

            match self.chain.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) if receipt.status == Some(0) => {
                    let _guard = self.locks.acquire(intent.id).await;
                    self.fail_intent(&intent, "transaction reverted on chain")
                        .await?;
                    reconciled += 1;
                }
                Ok(_) => {
                    // 未上链或成功：等事件流补齐
                }
                Err(e) => {
                    tracing::warn!(
                        intent_id = %intent.id,
                        tx_hash = %tx_hash,
                        error = %e,
                        "Receipt lookup failed during reconciliation"
                    );
                }
            }
        }
        Ok(reconciled)
    }

    // ============ 内部工具 ============

    async fn submit_release(
        &self,
        intent: &PaymentIntent,
        op: &'static str,
    ) -> Result<(), EngineError> {
        let payment_id = intent
            .escrow_payment_id
            .context("Processing intent is missing escrow_payment_id")?;

        match self.chain.release(payment_id).await {
            Ok(tx_hash) => {
                self.intents.set_release_tx(intent.id, &tx_hash).await?;
                tracing::info!(
                    intent_id = %intent.id,
                    payment_id = payment_id,
                    tx_hash = %tx_hash,
                    op = op,
                    "Release submitted"
                );
                Ok(())
            }
            Err(ChainError::Reverted(reason)) => {
                self.fail_intent(intent, &reason).await?;
                Ok(())
            }
            Err(ChainError::Unavailable(reason)) => Err(EngineError::ChainUnavailable(reason)),
        }
    }

    /// 守卫转换：领域规则 + 存储层条件更新双重校验
    async fn apply_transition(&self, intent: &PaymentIntent, to: IntentStatus) -> Result<()> {
        if !intent.status.can_transition_to(to) {
            anyhow::bail!(
                "Illegal transition {} -> {} for intent {}",
                intent.status.as_str(),
                to.as_str(),
                intent.id
            );
        }
        let moved = self.intents.transition(intent.id, intent.status, to).await?;
        if moved {
            metrics::inc_intent_transitions();
        } else {
            tracing::warn!(
                intent_id = %intent.id,
                from = intent.status.as_str(),
                to = to.as_str(),
                "Transition lost the race, another writer advanced first"
            );
        }
        Ok(())
    }

    /// 合约调用永久失败：FAILED + payment.failed
    async fn fail_intent(&self, intent: &PaymentIntent, reason: &str) -> Result<()> {
        let moved = self.intents.mark_failed(intent.id, reason).await?;
        if moved {
            metrics::inc_intent_transitions();
            self.emit_snapshot(intent.id, WebhookEventType::PaymentFailed)
                .await?;
            tracing::error!(
                intent_id = %intent.id,
                reason = %reason,
                "Intent failed permanently"
            );
        }
        Ok(())
    }

    /// 终态 SUCCEEDED 的意图挂入商户的待结算聚合
    async fn link_payout(&self, intent: &PaymentIntent) -> Result<()> {
        let Some(merchant) = self.merchants.find_by_id(intent.merchant_id).await? else {
            tracing::error!(
                intent_id = %intent.id,
                merchant_id = %intent.merchant_id,
                "Merchant vanished before payout linking"
            );
            return Ok(());
        };

        let gross = intent.crypto_amount;
        let (fee, net) = split_fee(gross, merchant.platform_fee_bps);
        let payout_id = self
            .payouts
            .attach_intent(intent.merchant_id, intent.id, gross, fee, net)
            .await?;
        self.intents.set_payout(intent.id, payout_id).await?;

        tracing::info!(
            intent_id = %intent.id,
            payout_id = %payout_id,
            gross = %gross,
            fee = %fee,
            net = %net,
            "Intent linked to payout"
        );
        Ok(())
    }

    /// 取刷新后的意图快照并入队 webhook
    async fn emit_snapshot(&self, intent_id: Uuid, event_type: WebhookEventType) -> Result<()> {
        let intent = self
            .intents
            .find_by_id(intent_id)
            .await?
            .with_context(|| format!("Intent {} vanished before webhook emission", intent_id))?;
        self.webhooks
            .emit(&intent, event_type, intent.api_view())
            .await?;
        Ok(())
    }

    async fn reload(&self, intent_id: Uuid) -> Result<PaymentIntent, EngineError> {
        self.intents
            .find_by_id(intent_id)
            .await?
            .ok_or(EngineError::IntentNotFound)
    }

    async fn current_status(&self, intent_id: Uuid) -> Result<Option<IntentStatus>> {
        Ok(self.intents.find_by_id(intent_id).await?.map(|i| i.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn fee_split_matches_basis_points() {
        // 20 DOT @ 250bps -> 0.5 DOT 平台费，19.5 DOT 净额
        let (fee, net) = split_fee(dec("20"), 250);
        assert_eq!(fee, dec("0.5"));
        assert_eq!(net, dec("19.5"));
    }

    #[test]
    fn fee_split_zero_and_full() {
        let (fee, net) = split_fee(dec("10"), 0);
        assert_eq!(fee, Decimal::ZERO);
        assert_eq!(net, dec("10"));

        let (fee, net) = split_fee(dec("10"), 10_000);
        assert_eq!(fee, dec("10"));
        assert_eq!(net, Decimal::ZERO);
    }

    #[test]
    fn fee_split_truncates_to_chain_precision() {
        let gross = dec("0.000000000000000003");
        let (fee, net) = split_fee(gross, 3_333);
        assert!(fee.scale() <= 18);
        assert_eq!(fee + net, gross);
    }
}
