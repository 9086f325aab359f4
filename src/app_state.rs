use std::sync::Arc;

use anyhow::Result;

use crate::{
    config::Config,
    infrastructure::{db::PgPool, job_lease::JobLeases},
    repository::{
        ChainEventRepository, IntentRepository, MerchantRepository, PayoutRepository,
        WebhookRepository,
    },
    service::{
        chain_client::{ChainClient, JsonRpcChainClient},
        event_ingestor::EventIngestor,
        intent_engine::IntentEngine,
        payout_service::PayoutService,
        price_service::PriceService,
        scheduler::Scheduler,
        webhook_dispatcher::WebhookDispatcher,
    },
};

/// 应用状态
/// 组合根：组件在这里单向接线（引擎只认端口，不触别家内部）
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub intents: IntentRepository,
    pub merchants: MerchantRepository,
    pub chain: Arc<dyn ChainClient>,
    pub price: Arc<PriceService>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub engine: Arc<IntentEngine>,
    pub ingestor: Arc<EventIngestor>,
    pub payout_service: Arc<PayoutService>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// 创建应用状态；`chain` 可替换（测试注入内存链）
    pub fn with_chain(
        pool: PgPool,
        config: Arc<Config>,
        chain: Arc<dyn ChainClient>,
    ) -> Result<Self> {
        let intents = IntentRepository::new(pool.clone());
        let merchants = MerchantRepository::new(pool.clone());
        let payouts = PayoutRepository::new(pool.clone());
        let webhook_events = WebhookRepository::new(pool.clone());
        let chain_events = ChainEventRepository::new(pool.clone());

        let price = Arc::new(PriceService::new(pool.clone(), &config.price));

        let webhooks = Arc::new(WebhookDispatcher::new(
            webhook_events,
            intents.clone(),
            merchants.clone(),
            config.webhook.clone(),
        ));

        let engine = Arc::new(IntentEngine::new(
            intents.clone(),
            merchants.clone(),
            payouts.clone(),
            price.clone(),
            chain.clone(),
            webhooks.clone(),
            config.intent.hold_window_secs,
        ));

        let ingestor = Arc::new(EventIngestor::new(
            chain.clone(),
            engine.clone(),
            chain_events,
            config.chain.ingest_max_blocks,
        ));

        let payout_service = Arc::new(PayoutService::new(
            merchants.clone(),
            payouts,
            chain.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            engine.clone(),
            webhooks.clone(),
            payout_service.clone(),
            intents.clone(),
            JobLeases::new(pool.clone()),
            config.intent.clone(),
            config.webhook.clone(),
        ));

        Ok(Self {
            pool,
            config,
            intents,
            merchants,
            chain,
            price,
            webhooks,
            engine,
            ingestor,
            payout_service,
            scheduler,
        })
    }

    pub fn new(pool: PgPool, config: Arc<Config>) -> Result<Self> {
        let chain: Arc<dyn ChainClient> = Arc::new(JsonRpcChainClient::new(&config.chain)?);
        Self::with_chain(pool, config, chain)
    }
}
