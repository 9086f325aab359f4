//! 链事件摄取
//! 只消费最终化区块；游标持久化，事件按链序应用，
//! (block_hash, log_index) 主键保证重放/重组下的幂等

use std::{collections::VecDeque, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    metrics,
    repository::ChainEventRepository,
    service::{
        chain_client::{ChainClient, ObservedEvent},
        intent_engine::{ApplyOutcome, IntentEngine},
    },
};

const POLL_INTERVAL_SECS: u64 = 5;
/// 观测到重组时回退的区块数
const REORG_REWIND_BLOCKS: u64 = 64;
/// 重放队列上限与存活时间（创建事件先于引用事件落地是常态，
/// 超时仍未匹配的多半是同合约上其他集成方的事件）
const REPLAY_QUEUE_MAX: usize = 256;
const REPLAY_TTL_SECS: i64 = 600;

struct ReplayEntry {
    observed: ObservedEvent,
    enqueued_at: DateTime<Utc>,
}

/// 有界重放队列：容量满丢最旧，超时条目在取出时丢弃
#[derive(Default)]
struct ReplayQueue {
    entries: VecDeque<ReplayEntry>,
}

impl ReplayQueue {
    fn push(&mut self, observed: ObservedEvent, now: DateTime<Utc>) {
        if self.entries.len() >= REPLAY_QUEUE_MAX {
            if let Some(dropped) = self.entries.pop_front() {
                tracing::warn!(
                    kind = dropped.observed.event.kind(),
                    payment_id = dropped.observed.event.payment_id(),
                    "Replay queue full, dropping oldest deferred event"
                );
            }
        }
        self.entries.push_back(ReplayEntry {
            observed,
            enqueued_at: now,
        });
    }

    /// 取出全部未超时条目；过期的就地丢弃
    fn drain_live(&mut self, now: DateTime<Utc>) -> Vec<ObservedEvent> {
        self.entries
            .drain(..)
            .filter_map(|entry| {
                if (now - entry.enqueued_at).num_seconds() > REPLAY_TTL_SECS {
                    tracing::warn!(
                        kind = entry.observed.event.kind(),
                        payment_id = entry.observed.event.payment_id(),
                        "Deferred chain event expired without matching intent"
                    );
                    None
                } else {
                    Some(entry.observed)
                }
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct EventIngestor {
    chain: Arc<dyn ChainClient>,
    engine: Arc<IntentEngine>,
    events: ChainEventRepository,
    max_blocks_per_tick: u64,
    replay_queue: Mutex<ReplayQueue>,
}

impl EventIngestor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        engine: Arc<IntentEngine>,
        events: ChainEventRepository,
        max_blocks_per_tick: u64,
    ) -> Self {
        Self {
            chain,
            engine,
            events,
            max_blocks_per_tick: max_blocks_per_tick.max(1),
            replay_queue: Mutex::new(ReplayQueue::default()),
        }
    }

    /// 后台任务：持续推进游标
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(POLL_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = POLL_INTERVAL_SECS,
            "Event ingestor started"
        );

        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(applied) => {
                    if applied > 0 {
                        tracing::info!(count = applied, "Applied chain events");
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Event ingestion tick failed");
                }
            }
        }
    }

    /// 单次推进：先重放挂起事件，再拉取新区间
    pub async fn tick(&self) -> Result<usize> {
        let mut applied = self.drain_replay_queue().await?;

        let head = self
            .chain
            .finalized_block()
            .await
            .context("Failed to read finalized head")?;

        let cursor = self.events.cursor().await?;
        let (cursor_block, cursor_hash) = match cursor {
            Some(c) => c,
            None => {
                // 首次启动：从当前最终化高度开始，不回放历史
                let hash = self
                    .chain
                    .block_hash(head)
                    .await
                    .context("Failed to read head block hash")?
                    .context("Finalized head has no hash")?;
                self.events.set_cursor(head as i64, &hash).await?;
                tracing::info!(block = head, "Ingest cursor initialized");
                return Ok(applied);
            }
        };
        let cursor_block = cursor_block as u64;

        // 重组检测：最终化流里游标区块的哈希变了，回退重放
        // （幂等键会吞掉重复，状态条件会拦住矛盾转换）
        match self.chain.block_hash(cursor_block).await? {
            Some(hash) if hash.eq_ignore_ascii_case(&cursor_hash) => {}
            observed_hash => {
                let rewound = cursor_block.saturating_sub(REORG_REWIND_BLOCKS);
                tracing::error!(
                    cursor_block = cursor_block,
                    recorded_hash = %cursor_hash,
                    observed_hash = ?observed_hash,
                    rewound_to = rewound,
                    "Reorg past finality window detected, rewinding cursor"
                );
                let rewound_hash = self
                    .chain
                    .block_hash(rewound)
                    .await?
                    .unwrap_or_default();
                self.events.set_cursor(rewound as i64, &rewound_hash).await?;
                return Ok(applied);
            }
        }

        if head <= cursor_block {
            return Ok(applied);
        }

        let from = cursor_block + 1;
        let to = head.min(cursor_block + self.max_blocks_per_tick);

        let observed = self
            .chain
            .escrow_logs(from, to)
            .await
            .with_context(|| format!("Failed to fetch escrow logs {}..={}", from, to))?;

        for event in observed {
            if self.apply(event).await? {
                applied += 1;
            }
        }

        let to_hash = self
            .chain
            .block_hash(to)
            .await?
            .with_context(|| format!("Block {} vanished while advancing cursor", to))?;
        self.events.set_cursor(to as i64, &to_hash).await?;

        Ok(applied)
    }

    /// 应用单条事件；返回是否真正落到了状态机上
    async fn apply(&self, observed: ObservedEvent) -> Result<bool> {
        // 幂等：已登记的 (block_hash, log_index) 不再触达状态机
        if self
            .events
            .contains(&observed.block_hash, observed.log_index)
            .await?
        {
            metrics::inc_chain_events_duplicate();
            tracing::debug!(
                block_hash = %observed.block_hash,
                log_index = observed.log_index,
                kind = observed.event.kind(),
                "Duplicate chain event dropped"
            );
            return Ok(false);
        }

        let outcome = self
            .engine
            .on_chain_event(&observed)
            .await
            .with_context(|| {
                format!(
                    "Engine rejected event {} at ({}, {})",
                    observed.event.kind(),
                    observed.block_hash,
                    observed.log_index
                )
            })?;

        match outcome {
            ApplyOutcome::Applied | ApplyOutcome::Ignored => {
                // 先应用后登记：中间崩溃会导致重复应用，
                // 状态条件更新保证重复是无害的
                self.events
                    .try_record(&observed.block_hash, observed.log_index)
                    .await?;
                if outcome == ApplyOutcome::Applied {
                    metrics::inc_chain_events_applied();
                    return Ok(true);
                }
                Ok(false)
            }
            ApplyOutcome::Deferred => {
                metrics::inc_chain_events_deferred();
                self.enqueue_replay(observed).await;
                Ok(false)
            }
        }
    }

    async fn enqueue_replay(&self, observed: ObservedEvent) {
        tracing::debug!(
            kind = observed.event.kind(),
            payment_id = observed.event.payment_id(),
            "Deferred chain event queued for replay"
        );
        self.replay_queue.lock().await.push(observed, Utc::now());
    }

    /// 重试挂起事件；过期条目直接丢弃
    async fn drain_replay_queue(&self) -> Result<usize> {
        let pending = {
            let mut queue = self.replay_queue.lock().await;
            queue.drain_live(Utc::now())
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let mut applied = 0usize;
        for observed in pending {
            if self.apply(observed).await? {
                applied += 1;
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::chain_client::EscrowEvent;

    fn observed(payment_id: i64, n: u64) -> ObservedEvent {
        ObservedEvent {
            block_number: n,
            block_hash: format!("0x{:064x}", n),
            log_index: 0,
            tx_hash: format!("0xtx{:x}", n),
            event: EscrowEvent::Deposited {
                payment_id,
                from: "0x3333333333333333333333333333333333333333".to_string(),
                amount: 1,
            },
        }
    }

    #[test]
    fn replay_queue_caps_at_limit() {
        let mut queue = ReplayQueue::default();
        let now = Utc::now();
        for n in 0..(REPLAY_QUEUE_MAX as u64 + 10) {
            queue.push(observed(n as i64, n), now);
        }
        assert_eq!(queue.len(), REPLAY_QUEUE_MAX);

        // 最旧的 10 条被挤掉
        let live = queue.drain_live(now);
        assert_eq!(live[0].event.payment_id(), 10);
    }

    #[test]
    fn replay_queue_drops_expired_entries() {
        let mut queue = ReplayQueue::default();
        let now = Utc::now();
        queue.push(observed(1, 1), now - chrono::Duration::seconds(REPLAY_TTL_SECS + 1));
        queue.push(observed(2, 2), now);

        let live = queue.drain_live(now);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].event.payment_id(), 2);
        assert_eq!(queue.len(), 0);
    }
}
