//! 硬件通道默认拦截器
//!
//! - `LoggingInterceptor`：进入/退出日志与耗时
//! - `SessionInterceptor`：NFC 会话开启/释放（中止或被丢弃时也释放）
//! - `RetryInterceptor`：仅对瞬时错误（断连/超时）指数退避重试
//! - `TimeoutInterceptor`：等待用户操作超时

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;

use crate::error::{CustodyError, HardwareFailureReason, Result};
use crate::service::hardware_channel::{
    HardwareCommand, HardwareInterceptor, HardwareResponse, NfcCommands, Next,
};

/// 日志拦截器
pub struct LoggingInterceptor;

#[async_trait]
impl HardwareInterceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn intercept(&self, command: HardwareCommand, next: Next) -> Result<HardwareResponse> {
        let kind = command.kind();
        let start = Instant::now();
        tracing::info!(command = kind, "Hardware command started");

        let result = next.run(command).await;

        match &result {
            Ok(_) => tracing::info!(
                command = kind,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Hardware command completed"
            ),
            Err(e) => tracing::warn!(
                command = kind,
                elapsed_ms = start.elapsed().as_millis() as u64,
                error = %e,
                error_code = e.code(),
                "Hardware command failed"
            ),
        }

        result
    }
}

/// 会话守卫：未显式释放时在 Drop 中异步释放
struct SessionGuard {
    commands: Option<Arc<dyn NfcCommands>>,
}

impl SessionGuard {
    async fn release(mut self) {
        if let Some(commands) = self.commands.take() {
            commands.end_session().await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(commands) = self.commands.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    commands.end_session().await;
                    tracing::debug!("Hardware session released in Drop");
                });
            }
            Err(_) => {
                tracing::warn!("No runtime available, hardware session not released");
            }
        }
    }
}

/// 会话生命周期拦截器
pub struct SessionInterceptor {
    commands: Arc<dyn NfcCommands>,
}

impl SessionInterceptor {
    pub fn new(commands: Arc<dyn NfcCommands>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl HardwareInterceptor for SessionInterceptor {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn intercept(&self, command: HardwareCommand, next: Next) -> Result<HardwareResponse> {
        self.commands.begin_session().await?;
        let guard = SessionGuard {
            commands: Some(Arc::clone(&self.commands)),
        };

        let result = next.run(command).await;
        guard.release().await;
        result
    }
}

/// 重试拦截器
pub struct RetryInterceptor {
    max_retries: u32,
    initial_backoff: Duration,
}

impl RetryInterceptor {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
        }
    }

    fn should_retry(err: &CustodyError) -> bool {
        err.hardware_reason()
            .map(|reason| reason.is_transient())
            .unwrap_or(false)
    }
}

#[async_trait]
impl HardwareInterceptor for RetryInterceptor {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn intercept(&self, command: HardwareCommand, next: Next) -> Result<HardwareResponse> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0;

        loop {
            match next.clone().run(command.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if Self::should_retry(&e) && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        command = command.kind(),
                        error = %e,
                        attempt,
                        max_retries = self.max_retries,
                        next_retry_in_ms = backoff.as_millis() as u64,
                        "Transient hardware failure, will retry"
                    );

                    // 指数退避
                    sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// 超时拦截器
pub struct TimeoutInterceptor {
    timeout: Duration,
}

impl TimeoutInterceptor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HardwareInterceptor for TimeoutInterceptor {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn intercept(&self, command: HardwareCommand, next: Next) -> Result<HardwareResponse> {
        let kind = command.kind();
        tokio::time::timeout(self.timeout, next.run(command))
            .await
            .map_err(|_| {
                tracing::warn!(
                    command = kind,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Hardware command timed out"
                );
                CustodyError::hardware(HardwareFailureReason::Timeout)
            })?
    }
}
