//! 价格预言机
//! 查询路径：内存缓存 -> price_quotes 表 -> CoinGecko
//! 刷新失败不会使缓存失效，超过过期上限才算不可用

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::{
    config::PriceOracleConfig,
    domain::{CryptoCurrency, FiatCurrency},
    infrastructure::db::PgPool,
};

const SUPPORTED_CRYPTO: [CryptoCurrency; 2] = [CryptoCurrency::Dot, CryptoCurrency::Ksm];
const SUPPORTED_FIAT: [FiatCurrency; 4] = [
    FiatCurrency::Usd,
    FiatCurrency::Eur,
    FiatCurrency::Gbp,
    FiatCurrency::Jpy,
];

/// 带时间戳的报价
#[derive(Debug, Clone, Copy)]
pub struct PriceQuote {
    /// 1 crypto 的法币价格
    pub rate: Decimal,
    pub taken_at: DateTime<Utc>,
}

pub struct PriceService {
    pool: PgPool,
    cache: Arc<RwLock<HashMap<(CryptoCurrency, FiatCurrency), PriceQuote>>>,
    client: reqwest::Client,
    api_url: String,
    max_age_secs: i64,
    refresh_secs: u64,
}

/// 符号转 CoinGecko ID
fn coingecko_id(crypto: CryptoCurrency) -> &'static str {
    match crypto {
        CryptoCurrency::Dot => "polkadot",
        CryptoCurrency::Ksm => "kusama",
    }
}

impl PriceService {
    pub fn new(pool: PgPool, cfg: &PriceOracleConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            pool,
            cache: Arc::new(RwLock::new(HashMap::new())),
            client,
            api_url: cfg.api_url.clone(),
            max_age_secs: cfg.max_age_secs as i64,
            refresh_secs: cfg.refresh_secs,
        }
    }

    fn is_fresh(&self, taken_at: DateTime<Utc>) -> bool {
        (Utc::now() - taken_at).num_seconds() <= self.max_age_secs
    }

    /// 取报价；超过过期上限返回错误（上层映射为 PRICE_UNAVAILABLE）
    pub async fn rate(
        &self,
        fiat: FiatCurrency,
        crypto: CryptoCurrency,
    ) -> Result<PriceQuote> {
        // 1. 内存缓存
        {
            let cache = self.cache.read().await;
            if let Some(quote) = cache.get(&(crypto, fiat)) {
                if self.is_fresh(quote.taken_at) {
                    return Ok(*quote);
                }
            }
        }

        // 2. 数据库（其他实例刷新过的暖数据）
        let row: Option<(Decimal, DateTime<Utc>)> = sqlx::query_as(
            "SELECT rate, taken_at FROM price_quotes \
             WHERE crypto_currency = $1 AND fiat_currency = $2",
        )
        .bind(crypto.as_str())
        .bind(fiat.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query price quote")?;

        if let Some((rate, taken_at)) = row {
            if self.is_fresh(taken_at) {
                let quote = PriceQuote { rate, taken_at };
                self.cache.write().await.insert((crypto, fiat), quote);
                return Ok(quote);
            }
        }

        // 3. 直接拉一次上游
        self.fetch_and_update_all().await.with_context(|| {
            format!(
                "Price for {}/{} is stale beyond {}s and refresh failed",
                fiat.as_str(),
                crypto.as_str(),
                self.max_age_secs
            )
        })?;

        let cache = self.cache.read().await;
        match cache.get(&(crypto, fiat)) {
            Some(quote) if self.is_fresh(quote.taken_at) => Ok(*quote),
            _ => anyhow::bail!(
                "No fresh price for pair {}/{}",
                fiat.as_str(),
                crypto.as_str()
            ),
        }
    }

    /// 拉取全部支持币对并更新缓存与数据库
    async fn fetch_and_update_all(&self) -> Result<()> {
        let ids: Vec<&str> = SUPPORTED_CRYPTO.iter().map(|c| coingecko_id(*c)).collect();
        let currencies: Vec<&str> = SUPPORTED_FIAT.iter().map(|f| f.as_str()).collect();
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies={}",
            self.api_url,
            ids.join(","),
            currencies.join(",")
        );

        let response = self
            .client
            .get(&url)
            .header("User-Agent", "dotgate/0.1")
            .send()
            .await
            .context("Failed to fetch prices")?;

        if !response.status().is_success() {
            anyhow::bail!("Price API error: {}", response.status());
        }

        let data: HashMap<String, HashMap<String, f64>> = response
            .json()
            .await
            .context("Failed to parse price response")?;

        let now = Utc::now();
        let mut updated = 0usize;

        for crypto in SUPPORTED_CRYPTO {
            let Some(per_fiat) = data.get(coingecko_id(crypto)) else {
                tracing::warn!(crypto = crypto.as_str(), "Price API response missing asset");
                continue;
            };
            for fiat in SUPPORTED_FIAT {
                let Some(raw) = per_fiat.get(fiat.as_str()) else {
                    continue;
                };
                let Some(rate) = Decimal::from_f64_retain(*raw) else {
                    tracing::warn!(
                        crypto = crypto.as_str(),
                        fiat = fiat.as_str(),
                        raw = raw,
                        "Unrepresentable price value"
                    );
                    continue;
                };
                if rate <= Decimal::ZERO {
                    continue;
                }

                sqlx::query(
                    "INSERT INTO price_quotes (crypto_currency, fiat_currency, rate, taken_at) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (crypto_currency, fiat_currency) \
                     DO UPDATE SET rate = EXCLUDED.rate, taken_at = EXCLUDED.taken_at",
                )
                .bind(crypto.as_str())
                .bind(fiat.as_str())
                .bind(rate)
                .bind(now)
                .execute(&self.pool)
                .await
                .context("Failed to upsert price quote")?;

                self.cache
                    .write()
                    .await
                    .insert((crypto, fiat), PriceQuote { rate, taken_at: now });
                updated += 1;
            }
        }

        if updated == 0 {
            anyhow::bail!("Price API returned no usable pairs");
        }
        tracing::debug!(pairs = updated, "Price table refreshed");
        Ok(())
    }

    /// 后台任务：定时刷新全部币对
    pub async fn start_refresher(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.refresh_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(interval_secs = self.refresh_secs, "Price refresher started");

        loop {
            ticker.tick().await;
            if let Err(e) = self.fetch_and_update_all().await {
                // 缓存仍然有效，直到超过过期上限
                tracing::warn!(error = ?e, "Price refresh failed, serving cached rates");
            }
        }
    }

    /// 直接灌入一条报价（测试与无网络联调用）
    pub async fn seed_quote(
        &self,
        crypto: CryptoCurrency,
        fiat: FiatCurrency,
        rate: Decimal,
        taken_at: DateTime<Utc>,
    ) {
        self.cache
            .write()
            .await
            .insert((crypto, fiat), PriceQuote { rate, taken_at });
    }
}
