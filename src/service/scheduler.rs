//! 周期任务调度
//! 每个任务都套单飞租约（Postgres advisory lock），多实例部署下
//! 同一任务同一时刻只有一个执行者

use std::{sync::Arc, time::Duration};

use anyhow::Result;

use crate::{
    config::{IntentConfig, WebhookConfig},
    infrastructure::job_lease::JobLeases,
    repository::IntentRepository,
    service::{
        intent_engine::IntentEngine, payout_service::PayoutService,
        webhook_dispatcher::WebhookDispatcher,
    },
};

const JOB_EXPIRE: &str = "expire-intents";
const JOB_AUTO_RELEASE: &str = "auto-release";
const JOB_WEBHOOK_SWEEP: &str = "webhook-sweep";
const JOB_PAYOUT_BATCH: &str = "payout-batch";

const SCAN_BATCH: i64 = 100;

pub struct Scheduler {
    engine: Arc<IntentEngine>,
    dispatcher: Arc<WebhookDispatcher>,
    payouts: Arc<PayoutService>,
    intents: IntentRepository,
    leases: JobLeases,
    intent_cfg: IntentConfig,
    webhook_cfg: WebhookConfig,
}

impl Scheduler {
    pub fn new(
        engine: Arc<IntentEngine>,
        dispatcher: Arc<WebhookDispatcher>,
        payouts: Arc<PayoutService>,
        intents: IntentRepository,
        leases: JobLeases,
        intent_cfg: IntentConfig,
        webhook_cfg: WebhookConfig,
    ) -> Self {
        Self {
            engine,
            dispatcher,
            payouts,
            intents,
            leases,
            intent_cfg,
            webhook_cfg,
        }
    }

    /// 启动全部周期任务
    pub fn spawn_all(self: Arc<Self>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let interval = scheduler.intent_cfg.expire_interval_secs;
            scheduler.run_job(JOB_EXPIRE, interval).await;
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let interval = scheduler.intent_cfg.auto_release_interval_secs;
            scheduler.run_job(JOB_AUTO_RELEASE, interval).await;
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let interval = scheduler.webhook_cfg.sweep_interval_secs;
            scheduler.run_job(JOB_WEBHOOK_SWEEP, interval).await;
        });

        let scheduler = self;
        tokio::spawn(async move {
            let interval = scheduler.intent_cfg.payout_interval_secs;
            scheduler.run_job(JOB_PAYOUT_BATCH, interval).await;
        });

        tracing::info!("Scheduler jobs spawned");
    }

    async fn run_job(&self, job: &'static str, interval_secs: u64) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(job = job, interval_secs = interval_secs, "Job loop started");

        loop {
            ticker.tick().await;

            // 单飞：拿不到租约说明别的实例正在跑
            let lease = match self.leases.try_acquire(job).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    tracing::debug!(job = job, "Job lease held elsewhere, skipping tick");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(job = job, error = ?e, "Job lease unavailable");
                    continue;
                }
            };

            let result = match job {
                JOB_EXPIRE => self.run_expire().await,
                JOB_AUTO_RELEASE => self.run_auto_release().await,
                JOB_WEBHOOK_SWEEP => self.dispatcher.sweep().await,
                JOB_PAYOUT_BATCH => self.payouts.run_batch().await,
                _ => unreachable!("unknown job {job}"),
            };

            match result {
                Ok(processed) => {
                    if processed > 0 {
                        tracing::info!(job = job, count = processed, "Job tick completed");
                    }
                }
                Err(e) => {
                    tracing::error!(job = job, error = ?e, "Job tick failed");
                }
            }
            drop(lease);
        }
    }

    async fn run_expire(&self) -> Result<usize> {
        let expired = self.intents.find_expired_awaiting_payment(SCAN_BATCH).await?;
        let mut processed = 0usize;
        for intent in expired {
            match self.engine.expire(intent.id).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    tracing::warn!(intent_id = %intent.id, error = ?e, "Expire failed");
                }
            }
        }
        Ok(processed)
    }

    async fn run_auto_release(&self) -> Result<usize> {
        let due = self
            .intents
            .find_auto_release_due(self.intent_cfg.hold_window_secs, SCAN_BATCH)
            .await?;
        let mut processed = 0usize;
        for intent in due {
            match self.engine.auto_release(intent.id).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    tracing::warn!(intent_id = %intent.id, error = ?e, "Auto-release failed");
                }
            }
        }
        Ok(processed)
    }
}
