// 链客户端 - 生产级实现
// 托管合约调用、事件日志拉取、最终化高度查询；RPC 端点按配置顺序故障转移
//
// 事件物理布局约定：paymentId 为 indexed uint64（topic 1），
// 其余参数按 32 字节 ABI 字排入 data。

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};

use crate::{
    config::ChainConfig,
    metrics,
    service::signer::{LegacyTransaction, TxSigner},
};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 1000;
/// gas 估算的安全余量（乘 12/10）
const GAS_MARGIN_NUM: u64 = 12;
const GAS_MARGIN_DEN: u64 = 10;

/// 链调用错误：transient 与 permanent 的区分决定意图是否进入 failed
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// RPC 不可达 / 超时 / 节点故障，重试耗尽后向上层报 503
    #[error("chain rpc unavailable: {0}")]
    Unavailable(String),
    /// 合约回滚（估算阶段拒绝），永久失败
    #[error("contract call reverted: {0}")]
    Reverted(String),
}

/// 交易回执
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    /// 1 = 成功，0 = 链上执行失败
    pub status: Option<u8>,
}

/// 托管合约事件（已解码）
#[derive(Debug, Clone, PartialEq)]
pub enum EscrowEvent {
    PaymentCreated {
        payment_id: i64,
        merchant: String,
        amount: u128,
        fee_bps: u16,
    },
    Deposited {
        payment_id: i64,
        from: String,
        amount: u128,
    },
    PaymentReleased {
        payment_id: i64,
        to: String,
        amount: u128,
        fee: u128,
    },
    PaymentRefunded {
        payment_id: i64,
        to: String,
        amount: u128,
    },
    PaymentCanceled {
        payment_id: i64,
    },
}

impl EscrowEvent {
    pub fn payment_id(&self) -> i64 {
        match self {
            EscrowEvent::PaymentCreated { payment_id, .. }
            | EscrowEvent::Deposited { payment_id, .. }
            | EscrowEvent::PaymentReleased { payment_id, .. }
            | EscrowEvent::PaymentRefunded { payment_id, .. }
            | EscrowEvent::PaymentCanceled { payment_id } => *payment_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EscrowEvent::PaymentCreated { .. } => "PaymentCreated",
            EscrowEvent::Deposited { .. } => "Deposited",
            EscrowEvent::PaymentReleased { .. } => "PaymentReleased",
            EscrowEvent::PaymentRefunded { .. } => "PaymentRefunded",
            EscrowEvent::PaymentCanceled { .. } => "PaymentCanceled",
        }
    }
}

/// 日志中观测到的事件，带幂等键与链序
#[derive(Debug, Clone)]
pub struct ObservedEvent {
    pub block_number: u64,
    pub block_hash: String,
    pub log_index: i64,
    pub tx_hash: String,
    pub event: EscrowEvent,
}

/// 链能力契约；测试用内存实现替换（见 tests/common）
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn create_payment(
        &self,
        merchant_wallet: &str,
        amount: u128,
        fee_bps: u16,
    ) -> Result<String, ChainError>;
    async fn release(&self, payment_id: i64) -> Result<String, ChainError>;
    async fn refund(&self, payment_id: i64) -> Result<String, ChainError>;
    async fn cancel(&self, payment_id: i64) -> Result<String, ChainError>;
    /// 托管位当前入金额（0 = 未入金）
    async fn deposited_amount(&self, payment_id: i64) -> Result<u128, ChainError>;
    async fn finalized_block(&self) -> Result<u64, ChainError>;
    /// 指定高度的区块哈希（重组检测用）；区块不存在时返回 None
    async fn block_hash(&self, number: u64) -> Result<Option<String>, ChainError>;
    /// 区间内托管合约的全部事件，按 (block, log) 排序
    async fn escrow_logs(&self, from_block: u64, to_block: u64)
        -> Result<Vec<ObservedEvent>, ChainError>;
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ChainError>;
    /// 金库向商户钱包的原生转账（结算）
    async fn transfer(&self, to: &str, amount: u128) -> Result<String, ChainError>;
    /// 托管合约地址（即买家入金地址）
    fn escrow_address(&self) -> &str;
}

// ============ ABI 编解码 ============

pub mod abi {
    use super::*;

    pub fn keccak256(data: &[u8]) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// 函数选择器：keccak(签名) 前 4 字节
    pub fn selector(signature: &str) -> [u8; 4] {
        let digest = keccak256(signature.as_bytes());
        [digest[0], digest[1], digest[2], digest[3]]
    }

    /// 事件主题：keccak(规范签名)
    pub fn event_topic(signature: &str) -> String {
        format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
    }

    pub fn encode_u128(value: u128) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[16..].copy_from_slice(&value.to_be_bytes());
        word
    }

    pub fn encode_u64(value: u64) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[24..].copy_from_slice(&value.to_be_bytes());
        word
    }

    pub fn encode_u16(value: u16) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[30..].copy_from_slice(&value.to_be_bytes());
        word
    }

    pub fn encode_address(addr: &str) -> Result<[u8; 32]> {
        let raw = hex::decode(addr.trim_start_matches("0x"))
            .with_context(|| format!("Invalid address hex: {}", addr))?;
        if raw.len() != 20 {
            anyhow::bail!("Address must be 20 bytes, got {}", raw.len());
        }
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&raw);
        Ok(word)
    }

    /// 从 32 字节字解出 u128（高 16 字节必须为 0）
    pub fn decode_u128(word: &[u8]) -> Result<u128> {
        if word.len() != 32 {
            anyhow::bail!("ABI word must be 32 bytes, got {}", word.len());
        }
        if word[..16].iter().any(|&b| b != 0) {
            anyhow::bail!("uint256 value exceeds u128 range");
        }
        Ok(u128::from_be_bytes(word[16..].try_into().expect("16 bytes")))
    }

    pub fn decode_u64(word: &[u8]) -> Result<u64> {
        let wide = decode_u128(word)?;
        u64::try_from(wide).context("uint value exceeds u64 range")
    }

    pub fn decode_address(word: &[u8]) -> Result<String> {
        if word.len() != 32 {
            anyhow::bail!("ABI word must be 32 bytes, got {}", word.len());
        }
        Ok(format!("0x{}", hex::encode(&word[12..])))
    }

    /// 主题（0x + 64 hex）中解出 uint64
    pub fn topic_u64(topic: &str) -> Result<u64> {
        let raw = hex::decode(topic.trim_start_matches("0x"))
            .with_context(|| format!("Invalid topic hex: {}", topic))?;
        decode_u64(&raw)
    }
}

// ============ 事件签名与主题 ============

const SIG_PAYMENT_CREATED: &str = "PaymentCreated(uint64,address,uint256,uint16)";
const SIG_DEPOSITED: &str = "Deposited(uint64,address,uint256)";
const SIG_PAYMENT_RELEASED: &str = "PaymentReleased(uint64,address,uint256,uint256)";
const SIG_PAYMENT_REFUNDED: &str = "PaymentRefunded(uint64,address,uint256)";
const SIG_PAYMENT_CANCELED: &str = "PaymentCanceled(uint64)";

static TOPIC_PAYMENT_CREATED: Lazy<String> = Lazy::new(|| abi::event_topic(SIG_PAYMENT_CREATED));
static TOPIC_DEPOSITED: Lazy<String> = Lazy::new(|| abi::event_topic(SIG_DEPOSITED));
static TOPIC_PAYMENT_RELEASED: Lazy<String> = Lazy::new(|| abi::event_topic(SIG_PAYMENT_RELEASED));
static TOPIC_PAYMENT_REFUNDED: Lazy<String> = Lazy::new(|| abi::event_topic(SIG_PAYMENT_REFUNDED));
static TOPIC_PAYMENT_CANCELED: Lazy<String> = Lazy::new(|| abi::event_topic(SIG_PAYMENT_CANCELED));

/// 按 topic0 解码日志；未知主题返回 None（同地址上的其他事件直接跳过）
pub fn decode_escrow_log(topics: &[String], data: &str) -> Result<Option<EscrowEvent>> {
    let topic0 = match topics.first() {
        Some(t) => t.to_lowercase(),
        None => return Ok(None),
    };
    let payment_id = || -> Result<i64> {
        let topic1 = topics
            .get(1)
            .context("Escrow event missing indexed paymentId topic")?;
        let id = abi::topic_u64(topic1)?;
        i64::try_from(id).context("paymentId exceeds i64 range")
    };
    let words = hex::decode(data.trim_start_matches("0x")).context("Invalid log data hex")?;
    let word = |i: usize| -> Result<&[u8]> {
        words
            .get(i * 32..(i + 1) * 32)
            .with_context(|| format!("Log data too short for word {}", i))
    };

    let event = if topic0 == *TOPIC_PAYMENT_CREATED {
        Some(EscrowEvent::PaymentCreated {
            payment_id: payment_id()?,
            merchant: abi::decode_address(word(0)?)?,
            amount: abi::decode_u128(word(1)?)?,
            fee_bps: abi::decode_u64(word(2)?)? as u16,
        })
    } else if topic0 == *TOPIC_DEPOSITED {
        Some(EscrowEvent::Deposited {
            payment_id: payment_id()?,
            from: abi::decode_address(word(0)?)?,
            amount: abi::decode_u128(word(1)?)?,
        })
    } else if topic0 == *TOPIC_PAYMENT_RELEASED {
        Some(EscrowEvent::PaymentReleased {
            payment_id: payment_id()?,
            to: abi::decode_address(word(0)?)?,
            amount: abi::decode_u128(word(1)?)?,
            fee: abi::decode_u128(word(2)?)?,
        })
    } else if topic0 == *TOPIC_PAYMENT_REFUNDED {
        Some(EscrowEvent::PaymentRefunded {
            payment_id: payment_id()?,
            to: abi::decode_address(word(0)?)?,
            amount: abi::decode_u128(word(1)?)?,
        })
    } else if topic0 == *TOPIC_PAYMENT_CANCELED {
        Some(EscrowEvent::PaymentCanceled {
            payment_id: payment_id()?,
        })
    } else {
        None
    };

    Ok(event)
}

// ============ 金额换算 ============

/// 链上原生单位的幂（10^18）
fn native_unit() -> Decimal {
    Decimal::from(1_000_000_000_000_000_000u64)
}

/// Decimal（链精度小数）-> 链上最小单位 u128
pub fn decimal_to_native(amount: Decimal) -> Result<u128> {
    let scaled = amount
        .checked_mul(native_unit())
        .context("Amount overflow when scaling to native units")?;
    if scaled.fract() != Decimal::ZERO {
        anyhow::bail!("Amount {} has more precision than the chain supports", amount);
    }
    if scaled.is_sign_negative() {
        anyhow::bail!("Amount must not be negative: {}", amount);
    }
    scaled
        .to_u128()
        .context("Amount does not fit in u128 native units")
}

/// 链上最小单位 -> Decimal
pub fn native_to_decimal(value: u128) -> Result<Decimal> {
    let wide = Decimal::from_u128(value).context("Native value exceeds decimal range")?;
    wide.checked_div(native_unit())
        .context("Native value division failed")
}

// ============ JSON-RPC 实现 ============

pub struct JsonRpcChainClient {
    http_client: reqwest::Client,
    rpc_urls: Vec<String>,
    escrow_contract: String,
    signer: TxSigner,
}

impl JsonRpcChainClient {
    pub fn new(cfg: &ChainConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.rpc_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let signer = TxSigner::from_hex(&cfg.platform_private_key, cfg.chain_id)?;
        if !signer.address().eq_ignore_ascii_case(&cfg.treasury_address) {
            tracing::warn!(
                derived = %signer.address(),
                configured = %cfg.treasury_address,
                "TREASURY_ADDRESS does not match the platform key; payouts will be signed from the derived address"
            );
        }

        Ok(Self {
            http_client,
            rpc_urls: cfg.rpc_urls.clone(),
            escrow_contract: cfg.escrow_contract.to_lowercase(),
            signer,
        })
    }

    /// JSON-RPC 调用，端点故障转移 + 重试
    /// 节点明确返回错误对象时不再换端点重试（错误是确定性的）
    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut last_error: Option<String> = None;

        for attempt in 1..=MAX_RETRIES {
            for endpoint in &self.rpc_urls {
                let response = self.http_client.post(endpoint).json(&payload).send().await;

                match response {
                    Ok(resp) => {
                        let body: Result<Value, _> = resp.json().await;
                        match body {
                            Ok(body) => {
                                if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
                                    metrics::inc_chain_rpc_err();
                                    let message = error
                                        .get("message")
                                        .and_then(|m| m.as_str())
                                        .unwrap_or("unknown rpc error")
                                        .to_string();
                                    if is_revert_error(&message) {
                                        return Err(ChainError::Reverted(message));
                                    }
                                    return Err(ChainError::Unavailable(format!(
                                        "{} failed: {}",
                                        method, message
                                    )));
                                }
                                metrics::inc_chain_rpc_ok();
                                return Ok(body.get("result").cloned().unwrap_or(Value::Null));
                            }
                            Err(e) => {
                                metrics::inc_chain_rpc_err();
                                tracing::warn!(
                                    endpoint = %endpoint,
                                    method = %method,
                                    error = ?e,
                                    "Malformed RPC response"
                                );
                                last_error = Some(e.to_string());
                            }
                        }
                    }
                    Err(e) => {
                        metrics::inc_chain_rpc_err();
                        tracing::warn!(
                            endpoint = %endpoint,
                            method = %method,
                            attempt = attempt,
                            error = ?e,
                            "RPC request failed, trying next endpoint"
                        );
                        last_error = Some(e.to_string());
                    }
                }
            }

            if attempt < MAX_RETRIES {
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64)).await;
            }
        }

        Err(ChainError::Unavailable(format!(
            "{} failed after {} attempts across {} endpoints: {}",
            method,
            MAX_RETRIES,
            self.rpc_urls.len(),
            last_error.unwrap_or_else(|| "no endpoints responded".to_string())
        )))
    }

    /// 签名并提交合约交易；返回交易哈希（fire-and-confirm，不等待最终性）
    async fn submit_tx(&self, to: &str, value: u128, data: Vec<u8>) -> Result<String, ChainError> {
        let from = self.signer.address().to_string();

        let nonce_hex = self
            .rpc_call("eth_getTransactionCount", json!([from, "pending"]))
            .await?;
        let nonce = parse_hex_u64(&nonce_hex)
            .map_err(|e| ChainError::Unavailable(format!("Bad nonce response: {}", e)))?;

        let gas_price_hex = self.rpc_call("eth_gasPrice", json!([])).await?;
        let gas_price = parse_hex_u128(&gas_price_hex)
            .map_err(|e| ChainError::Unavailable(format!("Bad gas price response: {}", e)))?;

        // 估算阶段的 revert 即永久失败信号
        let call = json!({
            "from": from,
            "to": to,
            "value": format!("0x{:x}", value),
            "data": format!("0x{}", hex::encode(&data)),
        });
        let gas_hex = self.rpc_call("eth_estimateGas", json!([call])).await?;
        let gas_estimate = parse_hex_u64(&gas_hex)
            .map_err(|e| ChainError::Unavailable(format!("Bad gas estimate: {}", e)))?;
        let gas_limit = gas_estimate * GAS_MARGIN_NUM / GAS_MARGIN_DEN;

        let to_bytes: [u8; 20] = hex::decode(to.trim_start_matches("0x"))
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| ChainError::Unavailable(format!("Invalid target address: {}", to)))?;

        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas_limit,
            to: Some(to_bytes),
            value,
            data,
        };
        let raw = self
            .signer
            .sign_transaction(&tx)
            .map_err(|e| ChainError::Unavailable(format!("Signing failed: {}", e)))?;

        let tx_hash = self
            .rpc_call("eth_sendRawTransaction", json!([raw]))
            .await?;
        tx_hash
            .as_str()
            .map(|s| s.to_lowercase())
            .ok_or_else(|| ChainError::Unavailable("Missing tx hash in response".to_string()))
    }

    async fn escrow_call(&self, data: Vec<u8>) -> Result<String, ChainError> {
        self.submit_tx(&self.escrow_contract, 0, data).await
    }

    async fn block_field(
        &self,
        tag: Value,
        field: &str,
    ) -> Result<Option<String>, ChainError> {
        let block = self
            .rpc_call("eth_getBlockByNumber", json!([tag, false]))
            .await?;
        if block.is_null() {
            return Ok(None);
        }
        Ok(block
            .get(field)
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase()))
    }
}

fn is_revert_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("revert") || lower.contains("execution reverted")
}

fn parse_hex_u64(value: &Value) -> Result<u64> {
    let s = value.as_str().context("Expected hex string")?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).context("Invalid hex quantity")
}

fn parse_hex_u128(value: &Value) -> Result<u128> {
    let s = value.as_str().context("Expected hex string")?;
    u128::from_str_radix(s.trim_start_matches("0x"), 16).context("Invalid hex quantity")
}

#[async_trait]
impl ChainClient for JsonRpcChainClient {
    async fn create_payment(
        &self,
        merchant_wallet: &str,
        amount: u128,
        fee_bps: u16,
    ) -> Result<String, ChainError> {
        let mut data = abi::selector("createPayment(address,uint256,uint16)").to_vec();
        data.extend_from_slice(
            &abi::encode_address(merchant_wallet)
                .map_err(|e| ChainError::Unavailable(e.to_string()))?,
        );
        data.extend_from_slice(&abi::encode_u128(amount));
        data.extend_from_slice(&abi::encode_u16(fee_bps));
        self.escrow_call(data).await
    }

    async fn release(&self, payment_id: i64) -> Result<String, ChainError> {
        let mut data = abi::selector("release(uint64)").to_vec();
        data.extend_from_slice(&abi::encode_u64(payment_id as u64));
        self.escrow_call(data).await
    }

    async fn refund(&self, payment_id: i64) -> Result<String, ChainError> {
        let mut data = abi::selector("refund(uint64)").to_vec();
        data.extend_from_slice(&abi::encode_u64(payment_id as u64));
        self.escrow_call(data).await
    }

    async fn cancel(&self, payment_id: i64) -> Result<String, ChainError> {
        let mut data = abi::selector("cancel(uint64)").to_vec();
        data.extend_from_slice(&abi::encode_u64(payment_id as u64));
        self.escrow_call(data).await
    }

    async fn deposited_amount(&self, payment_id: i64) -> Result<u128, ChainError> {
        let mut data = abi::selector("depositedAmount(uint64)").to_vec();
        data.extend_from_slice(&abi::encode_u64(payment_id as u64));

        let result = self
            .rpc_call(
                "eth_call",
                json!([
                    {
                        "to": self.escrow_contract,
                        "data": format!("0x{}", hex::encode(&data)),
                    },
                    "latest"
                ]),
            )
            .await?;

        let raw = result
            .as_str()
            .ok_or_else(|| ChainError::Unavailable("Non-string eth_call result".to_string()))?;
        let bytes = hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| ChainError::Unavailable(format!("Bad eth_call hex: {}", e)))?;
        abi::decode_u128(&bytes).map_err(|e| ChainError::Unavailable(e.to_string()))
    }

    async fn finalized_block(&self) -> Result<u64, ChainError> {
        let number = self
            .block_field(json!("finalized"), "number")
            .await?
            .ok_or_else(|| ChainError::Unavailable("No finalized block available".to_string()))?;
        u64::from_str_radix(number.trim_start_matches("0x"), 16)
            .map_err(|e| ChainError::Unavailable(format!("Bad block number: {}", e)))
    }

    async fn block_hash(&self, number: u64) -> Result<Option<String>, ChainError> {
        self.block_field(json!(format!("0x{:x}", number)), "hash")
            .await
    }

    async fn escrow_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ObservedEvent>, ChainError> {
        let topics: Vec<String> = vec![
            TOPIC_PAYMENT_CREATED.clone(),
            TOPIC_DEPOSITED.clone(),
            TOPIC_PAYMENT_RELEASED.clone(),
            TOPIC_PAYMENT_REFUNDED.clone(),
            TOPIC_PAYMENT_CANCELED.clone(),
        ];
        let filter = json!({
            "address": self.escrow_contract,
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
            "topics": [topics],
        });

        let logs = self.rpc_call("eth_getLogs", json!([filter])).await?;
        let logs = logs
            .as_array()
            .ok_or_else(|| ChainError::Unavailable("Non-array eth_getLogs result".to_string()))?;

        let mut observed = Vec::with_capacity(logs.len());
        for log in logs {
            // 节点返回 pending/removed 日志时跳过
            if log.get("removed").and_then(|v| v.as_bool()).unwrap_or(false) {
                continue;
            }
            let topics: Vec<String> = log
                .get("topics")
                .and_then(|t| t.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            let data = log.get("data").and_then(|v| v.as_str()).unwrap_or("0x");

            let event = match decode_escrow_log(&topics, data) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = ?e, "Undecodable escrow log, skipping");
                    continue;
                }
            };

            let block_number = log
                .get("blockNumber")
                .map(parse_hex_u64)
                .transpose()
                .map_err(|e| ChainError::Unavailable(format!("Bad log blockNumber: {}", e)))?
                .ok_or_else(|| ChainError::Unavailable("Log missing blockNumber".to_string()))?;
            let log_index = log
                .get("logIndex")
                .map(parse_hex_u64)
                .transpose()
                .map_err(|e| ChainError::Unavailable(format!("Bad log logIndex: {}", e)))?
                .ok_or_else(|| ChainError::Unavailable("Log missing logIndex".to_string()))?;
            let block_hash = log
                .get("blockHash")
                .and_then(|v| v.as_str())
                .map(|s| s.to_lowercase())
                .ok_or_else(|| ChainError::Unavailable("Log missing blockHash".to_string()))?;
            let tx_hash = log
                .get("transactionHash")
                .and_then(|v| v.as_str())
                .map(|s| s.to_lowercase())
                .ok_or_else(|| ChainError::Unavailable("Log missing transactionHash".to_string()))?;

            observed.push(ObservedEvent {
                block_number,
                block_hash,
                log_index: log_index as i64,
                tx_hash,
                event,
            });
        }

        // 链序：按 (区块, 日志序号)
        observed.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(observed)
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ChainError> {
        let receipt = self
            .rpc_call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if receipt.is_null() {
            return Ok(None);
        }

        let status = receipt
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(|s| u8::from_str_radix(s.trim_start_matches("0x"), 16).ok());
        let block_number = receipt
            .get("blockNumber")
            .and_then(|v| v.as_str())
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok());

        Ok(Some(TxReceipt {
            tx_hash: tx_hash.to_lowercase(),
            block_number,
            status,
        }))
    }

    async fn transfer(&self, to: &str, amount: u128) -> Result<String, ChainError> {
        self.submit_tx(to, amount, Vec::new()).await
    }

    fn escrow_address(&self) -> &str {
        &self.escrow_contract
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_known_vector() {
        // keccak("transfer(address,uint256)") 前4字节 = a9059cbb
        assert_eq!(
            abi::selector("transfer(address,uint256)"),
            [0xa9, 0x05, 0x9c, 0xbb]
        );
    }

    #[test]
    fn abi_words_round_trip() {
        let word = abi::encode_u128(20_000_000_000_000_000_000);
        assert_eq!(abi::decode_u128(&word).unwrap(), 20_000_000_000_000_000_000);

        let word = abi::encode_u64(42);
        assert_eq!(abi::decode_u64(&word).unwrap(), 42);

        let addr = "0x1111111111111111111111111111111111111111";
        let word = abi::encode_address(addr).unwrap();
        assert_eq!(abi::decode_address(&word).unwrap(), addr);
    }

    #[test]
    fn decode_rejects_oversized_uint() {
        let mut word = [0u8; 32];
        word[0] = 1;
        assert!(abi::decode_u128(&word).is_err());
    }

    #[test]
    fn decodes_payment_created_log() {
        let payment_id_topic = format!("0x{}", hex::encode(abi::encode_u64(7)));
        let merchant = "0x2222222222222222222222222222222222222222";
        let mut data = Vec::new();
        data.extend_from_slice(&abi::encode_address(merchant).unwrap());
        data.extend_from_slice(&abi::encode_u128(5_000));
        data.extend_from_slice(&abi::encode_u16(250));

        let topics = vec![TOPIC_PAYMENT_CREATED.clone(), payment_id_topic];
        let event = decode_escrow_log(&topics, &format!("0x{}", hex::encode(&data)))
            .unwrap()
            .unwrap();

        assert_eq!(
            event,
            EscrowEvent::PaymentCreated {
                payment_id: 7,
                merchant: merchant.to_string(),
                amount: 5_000,
                fee_bps: 250,
            }
        );
    }

    #[test]
    fn decodes_canceled_log_without_data() {
        let topics = vec![
            TOPIC_PAYMENT_CANCELED.clone(),
            format!("0x{}", hex::encode(abi::encode_u64(3))),
        ];
        let event = decode_escrow_log(&topics, "0x").unwrap().unwrap();
        assert_eq!(event, EscrowEvent::PaymentCanceled { payment_id: 3 });
    }

    #[test]
    fn unknown_topic_is_skipped() {
        let topics = vec![abi::event_topic("SomethingElse(uint256)")];
        assert!(decode_escrow_log(&topics, "0x").unwrap().is_none());
    }

    #[test]
    fn native_conversion_round_trips() {
        let amount: Decimal = "20.000000000000000000".parse().unwrap();
        let native = decimal_to_native(amount).unwrap();
        assert_eq!(native, 20_000_000_000_000_000_000);
        assert_eq!(native_to_decimal(native).unwrap(), amount);
    }

    #[test]
    fn native_conversion_rejects_excess_precision() {
        // 19 位小数超出链精度
        let amount = Decimal::new(1, 19);
        assert!(decimal_to_native(amount).is_err());
    }

    #[test]
    fn revert_detection() {
        assert!(is_revert_error("execution reverted: escrow: not funded"));
        assert!(is_revert_error("VM Exception: revert"));
        assert!(!is_revert_error("connection refused"));
    }
}
