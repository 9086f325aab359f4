//! 配置管理模块
//! 全部从环境变量加载，启动时校验关键项

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 应用配置结构体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub price: PriceOracleConfig,
    pub webhook: WebhookConfig,
    pub intent: IntentConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

/// 链配置：RPC 端点按故障转移顺序排列
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_urls: Vec<String>,
    pub chain_id: u64,
    /// 托管合约地址（同时也是买家入金地址）
    pub escrow_contract: String,
    /// 平台签名私钥（hex，不带 0x 前缀也可）
    pub platform_private_key: String,
    /// 释放资金归集的金库地址，结算从这里转出
    pub treasury_address: String,
    pub rpc_timeout_secs: u64,
    /// 单次摄取最多扫描的区块数
    pub ingest_max_blocks: u64,
}

/// 价格预言机配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceOracleConfig {
    pub api_url: String,
    pub refresh_secs: u64,
    /// 报价过期上限（秒），超过则 PRICE_UNAVAILABLE
    pub max_age_secs: u64,
    pub request_timeout_secs: u64,
}

/// Webhook 投递配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub max_attempts: i32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub request_timeout_secs: u64,
    pub workers: usize,
    pub sweep_interval_secs: u64,
}

/// 支付意图配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    /// 创建到可过期之间的保持窗口（秒）
    pub hold_window_secs: i64,
    pub expire_interval_secs: u64,
    pub auto_release_interval_secs: u64,
    pub payout_interval_secs: u64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        let rpc_urls: Vec<String> = env_or("CHAIN_RPC_URLS", "http://127.0.0.1:8545")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if rpc_urls.is_empty() {
            anyhow::bail!("CHAIN_RPC_URLS must list at least one endpoint");
        }

        let config = Self {
            server: ServerConfig {
                bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 20)?,
                acquire_timeout_secs: env_parse("DATABASE_ACQUIRE_TIMEOUT_SECS", 5)?,
            },
            chain: ChainConfig {
                rpc_urls,
                chain_id: env_parse("CHAIN_ID", 420_420_420)?,
                escrow_contract: std::env::var("ESCROW_CONTRACT_ADDRESS")
                    .context("ESCROW_CONTRACT_ADDRESS must be set")?,
                platform_private_key: std::env::var("PLATFORM_PRIVATE_KEY")
                    .context("PLATFORM_PRIVATE_KEY must be set")?,
                treasury_address: std::env::var("TREASURY_ADDRESS")
                    .context("TREASURY_ADDRESS must be set")?,
                rpc_timeout_secs: env_parse("CHAIN_RPC_TIMEOUT_SECS", 30)?,
                ingest_max_blocks: env_parse("INGEST_MAX_BLOCKS", 1000)?,
            },
            price: PriceOracleConfig {
                api_url: env_or("PRICE_API_URL", "https://api.coingecko.com/api/v3"),
                refresh_secs: env_parse("PRICE_REFRESH_SECS", 30)?,
                max_age_secs: env_parse("PRICE_MAX_AGE_SECS", 300)?,
                request_timeout_secs: env_parse("PRICE_REQUEST_TIMEOUT_SECS", 10)?,
            },
            webhook: WebhookConfig {
                max_attempts: env_parse("WEBHOOK_MAX_ATTEMPTS", 5)?,
                backoff_base_secs: env_parse("WEBHOOK_BACKOFF_BASE_SECS", 1)?,
                backoff_cap_secs: env_parse("WEBHOOK_BACKOFF_CAP_SECS", 600)?,
                request_timeout_secs: env_parse("WEBHOOK_TIMEOUT_SECS", 10)?,
                workers: env_parse("WEBHOOK_WORKERS", 16)?,
                sweep_interval_secs: env_parse("WEBHOOK_SWEEP_INTERVAL_SECS", 5)?,
            },
            intent: IntentConfig {
                hold_window_secs: env_parse("INTENT_HOLD_SECS", 300)?,
                expire_interval_secs: env_parse("INTENT_EXPIRE_INTERVAL_SECS", 30)?,
                auto_release_interval_secs: env_parse("INTENT_AUTO_RELEASE_INTERVAL_SECS", 30)?,
                payout_interval_secs: env_parse("PAYOUT_INTERVAL_SECS", 3600)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.chain.escrow_contract.starts_with("0x") || self.chain.escrow_contract.len() != 42 {
            anyhow::bail!(
                "ESCROW_CONTRACT_ADDRESS must be a 0x-prefixed 20-byte address, got {}",
                self.chain.escrow_contract
            );
        }
        if !self.chain.treasury_address.starts_with("0x") || self.chain.treasury_address.len() != 42
        {
            anyhow::bail!("TREASURY_ADDRESS must be a 0x-prefixed 20-byte address");
        }
        if self.intent.hold_window_secs <= 0 {
            anyhow::bail!("INTENT_HOLD_SECS must be positive");
        }
        if self.webhook.max_attempts < 1 {
            anyhow::bail!("WEBHOOK_MAX_ATTEMPTS must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default() {
        assert_eq!(env_parse("DOTGATE_TEST_MISSING_KEY", 42u64).unwrap(), 42);
    }
}
