//! 钱包级签名锁
//! 同一钱包同时最多一个签名流程；后来者排队（FIFO），不交错执行

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::descriptor::WalletId;
use crate::error::{CustodyError, Result};

/// 每个钱包一把异步互斥锁（tokio Mutex 按请求顺序公平唤醒）
#[derive(Default)]
pub struct WalletLockRegistry {
    locks: Mutex<HashMap<WalletId, Arc<AsyncMutex<()>>>>,
}

/// 锁守卫（超出作用域自动释放）
pub struct WalletLockGuard {
    wallet_id: WalletId,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl WalletLockGuard {
    pub fn wallet_id(&self) -> &WalletId {
        &self.wallet_id
    }
}

impl Drop for WalletLockGuard {
    fn drop(&mut self) {
        tracing::debug!(
            wallet_id = %self.wallet_id,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Released wallet signing lock"
        );
    }
}

impl WalletLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, wallet_id: &WalletId) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        // 清理无人持有也无人等待的锁
        locks.retain(|id, lock| id == wallet_id || Arc::strong_count(lock) > 1);
        locks
            .entry(wallet_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// 获取钱包锁（排队直到获取成功或超时）
    ///
    /// 超时返回 `SigningInProgress`。
    pub async fn acquire(&self, wallet_id: &WalletId, timeout: Duration) -> Result<WalletLockGuard> {
        let lock = self.lock_for(wallet_id);
        let start = Instant::now();

        let guard = tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                tracing::warn!(
                    wallet_id = %wallet_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for wallet signing lock"
                );
                CustodyError::SigningInProgress {
                    wallet_id: wallet_id.to_string(),
                }
            })?;

        tracing::debug!(
            wallet_id = %wallet_id,
            waited_ms = start.elapsed().as_millis() as u64,
            "Acquired wallet signing lock"
        );

        Ok(WalletLockGuard {
            wallet_id: wallet_id.clone(),
            acquired_at: Instant::now(),
            _guard: guard,
        })
    }

    /// 尝试获取锁（非阻塞）
    ///
    /// # 返回
    /// - `Some(WalletLockGuard)`: 获取成功
    /// - `None`: 已有签名流程在进行
    pub fn try_acquire(&self, wallet_id: &WalletId) -> Option<WalletLockGuard> {
        let lock = self.lock_for(wallet_id);
        lock.try_lock_owned().ok().map(|guard| WalletLockGuard {
            wallet_id: wallet_id.clone(),
            acquired_at: Instant::now(),
            _guard: guard,
        })
    }

    /// 当前登记的钱包数量
    pub fn len(&self) -> usize {
        match self.locks.lock() {
            Ok(locks) => locks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
