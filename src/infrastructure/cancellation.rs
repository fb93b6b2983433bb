//! 签名取消令牌
//! 用户在等待硬件时可随时取消；克隆共享同一取消状态

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct SigningCancellation {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for SigningCancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl SigningCancellation {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// 取消（幂等）
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// 等待取消发生
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                // sender 由自身持有，不会先于接收方释放
                std::future::pending::<()>().await;
            }
        }
    }
}
