//! 进程内按意图串行化的锁表
//!
//! 同一个意图的全部状态变更必须持有对应的锁；引用计数归零时清除表项，
//! 避免表随历史意图无限增长。锁内不允许等待链上最终性（见 IntentEngine）。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    refs: usize,
}

#[derive(Clone, Default)]
pub struct IntentLockMap {
    inner: Arc<Mutex<HashMap<Uuid, Entry>>>,
}

/// 锁守卫：先释放底层互斥量，再递减引用计数
pub struct IntentLockGuard {
    map: Arc<Mutex<HashMap<Uuid, Entry>>>,
    intent_id: Uuid,
    permit: Option<OwnedMutexGuard<()>>,
}

impl Drop for IntentLockGuard {
    fn drop(&mut self) {
        // 必须先放开互斥量：若先摘除表项，新的获取方会拿到一把全新的锁
        // 并与尚未退出的持有方并行
        self.permit.take();

        let mut map = match self.map.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = map.get_mut(&self.intent_id) {
            entry.refs -= 1;
            if entry.refs == 0 {
                map.remove(&self.intent_id);
            }
        }
    }
}

impl IntentLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取指定意图的互斥锁（等待者计入引用计数）
    pub async fn acquire(&self, intent_id: Uuid) -> IntentLockGuard {
        let lock = {
            let mut map = match self.inner.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = map.entry(intent_id).or_insert_with(|| Entry {
                lock: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            entry.lock.clone()
        };

        let permit = lock.lock_owned().await;

        IntentLockGuard {
            map: self.inner.clone(),
            intent_id,
            permit: Some(permit),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn serializes_same_intent() {
        let locks = IntentLockMap::new();
        let id = Uuid::new_v4();
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(id).await;
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                // 持锁期间不应有其他持有者进入
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                assert_eq!(counter.load(Ordering::SeqCst), seen + 1);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn entries_are_removed_when_released() {
        let locks = IntentLockMap::new();
        let id = Uuid::new_v4();
        {
            let _guard = locks.acquire(id).await;
            assert_eq!(locks.len(), 1);
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn distinct_intents_do_not_block_each_other() {
        let locks = IntentLockMap::new();
        let a = locks.acquire(Uuid::new_v4()).await;
        // 第二个意图的锁必须立即可得
        let b = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            locks.acquire(Uuid::new_v4()),
        )
        .await;
        assert!(b.is_ok());
        drop(a);
    }
}
