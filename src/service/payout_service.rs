//! 商户结算批处理
//! PaymentReleased 时意图已挂入商户的待结算聚合行（见 IntentEngine），
//! 这里按结算周期把聚合净额从金库转给商户钱包，确认后标记 SENT

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::{
    domain::{Merchant, Payout},
    metrics,
    repository::{MerchantRepository, PayoutRepository},
    service::chain_client::{decimal_to_native, ChainClient, ChainError},
};

/// 提交后就地等待回执的轮询参数
const CONFIRM_POLLS: u32 = 5;
const CONFIRM_POLL_DELAY_SECS: u64 = 3;

pub struct PayoutService {
    merchants: MerchantRepository,
    payouts: PayoutRepository,
    chain: Arc<dyn ChainClient>,
}

impl PayoutService {
    pub fn new(
        merchants: MerchantRepository,
        payouts: PayoutRepository,
        chain: Arc<dyn ChainClient>,
    ) -> Self {
        Self {
            merchants,
            payouts,
            chain,
        }
    }

    /// 单轮批处理：检查每个参与定时结算的商户
    pub async fn run_batch(&self) -> Result<usize> {
        let merchants = self.merchants.find_scheduled().await?;
        let mut settled = 0usize;

        for merchant in merchants {
            match self.settle_merchant(&merchant).await {
                Ok(true) => settled += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        merchant_id = %merchant.id,
                        error = ?e,
                        "Merchant settlement failed, continuing with others"
                    );
                }
            }
        }
        Ok(settled)
    }

    async fn settle_merchant(&self, merchant: &Merchant) -> Result<bool> {
        let mut any_settled = false;
        for payout in self.payouts.find_pending_for_merchant(merchant.id).await? {
            match &payout.tx_hash {
                // 已提交未确认：本轮只做确认，不再转账
                Some(tx_hash) => {
                    if self.confirm_submission(merchant, &payout, tx_hash).await? {
                        any_settled = true;
                    }
                }
                None => {
                    if self.submit_payout(merchant, &payout).await? {
                        any_settled = true;
                    }
                }
            }
        }
        Ok(any_settled)
    }

    /// 累积行达到门槛且周期已到时提交转账
    async fn submit_payout(&self, merchant: &Merchant, payout: &Payout) -> Result<bool> {
        // 结算周期未到
        if let Some(interval) = merchant.payout_schedule.interval() {
            if let Some(last) = merchant.last_payout_at {
                if last + interval > Utc::now() {
                    return Ok(false);
                }
            }
        } else {
            // Manual 商户不参与定时结算
            return Ok(false);
        }

        if payout.net < merchant.min_payout_amount {
            tracing::debug!(
                merchant_id = %merchant.id,
                net = %payout.net,
                min = %merchant.min_payout_amount,
                "Pending net below payout threshold"
            );
            return Ok(false);
        }

        let native = decimal_to_native(payout.net)
            .context("Payout net amount does not fit native units")?;

        let tx_hash = match self.chain.transfer(&merchant.wallet_address, native).await {
            Ok(tx) => tx,
            Err(ChainError::Reverted(reason)) => {
                tracing::error!(
                    payout_id = %payout.id,
                    merchant_id = %merchant.id,
                    reason = %reason,
                    "Payout transfer reverted"
                );
                self.payouts.mark_failed(payout.id).await?;
                return Ok(false);
            }
            Err(ChainError::Unavailable(reason)) => {
                tracing::warn!(
                    payout_id = %payout.id,
                    reason = %reason,
                    "Chain unavailable for payout, will retry next batch"
                );
                return Ok(false);
            }
        };

        // 先落哈希再等确认：中途崩溃也不会重复转账
        self.payouts.record_submission(payout.id, &tx_hash).await?;
        tracing::info!(
            payout_id = %payout.id,
            merchant_id = %merchant.id,
            net = %payout.net,
            intents = payout.intent_ids.len(),
            tx_hash = %tx_hash,
            "Payout transfer submitted"
        );

        self.confirm_submission(merchant, payout, &tx_hash).await
    }

    /// 轮询回执；确认成功 -> SENT，执行失败 -> FAILED，未确认留待下一轮
    async fn confirm_submission(
        &self,
        merchant: &Merchant,
        payout: &Payout,
        tx_hash: &str,
    ) -> Result<bool> {
        for _ in 0..CONFIRM_POLLS {
            match self.chain.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if receipt.status == Some(0) {
                        tracing::error!(
                            payout_id = %payout.id,
                            tx_hash = %tx_hash,
                            "Payout transfer failed on chain"
                        );
                        self.payouts.mark_failed(payout.id).await?;
                        return Ok(false);
                    }
                    self.payouts.mark_sent(payout.id, tx_hash).await?;
                    self.merchants
                        .set_last_payout_at(merchant.id, Utc::now())
                        .await?;
                    metrics::inc_payouts_sent();
                    tracing::info!(
                        payout_id = %payout.id,
                        merchant_id = %merchant.id,
                        tx_hash = %tx_hash,
                        "Payout settled"
                    );
                    return Ok(true);
                }
                Ok(None) => {
                    tokio::time::sleep(Duration::from_secs(CONFIRM_POLL_DELAY_SECS)).await;
                }
                Err(e) => {
                    tracing::warn!(
                        payout_id = %payout.id,
                        tx_hash = %tx_hash,
                        error = %e,
                        "Receipt lookup failed, will confirm next batch"
                    );
                    return Ok(false);
                }
            }
        }

        tracing::info!(
            payout_id = %payout.id,
            tx_hash = %tx_hash,
            "Payout not yet confirmed, deferring to next batch"
        );
        Ok(false)
    }
}
