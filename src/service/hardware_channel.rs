//! 硬件（NFC）交易通道
//!
//! 每次硬件交互都经过一条有序的拦截器链。拦截器对命令透明：
//! 调用方看到的行为与直接调用硬件一致，只是额外注入了进入/退出时的副作用
//! （日志、会话生命周期、重试、超时）。
//!
//! 组合顺序：先注册的在外层，最后注册的在最内层（最接近原始硬件调用）。
//! 任一拦截器都可以返回错误中止调用；外层已做的状态变更（如开启会话）在中止时被回滚。
//!
//! 一台设备只对应一条通道；协调器与持有证明签发方通过克隆共享它。
//! 同一通道上的命令串行执行，第二条命令在第一条的会话释放之后才开始。

use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bitcoin::secp256k1::ecdsa;
use futures::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

use crate::config::HardwareConfig;
use crate::domain::signature::SigningPayload;
use crate::error::{CustodyError, HardwareFailureReason, Result};
use crate::infrastructure::cancellation::SigningCancellation;
use crate::service::interceptors::{
    LoggingInterceptor, RetryInterceptor, SessionInterceptor, TimeoutInterceptor,
};

/// 硬件协议能力（NFC 线协议由外部实现）
#[async_trait]
pub trait NfcCommands: Send + Sync + 'static {
    /// 建立 NFC 会话
    async fn begin_session(&self) -> Result<()>;

    /// 释放会话（幂等）
    async fn end_session(&self);

    /// 对载荷中的每个摘要签名，按载荷顺序返回
    async fn sign(&self, payload: &SigningPayload) -> Result<Vec<ecdsa::Signature>>;

    /// 对挑战摘要签名（持有证明）
    async fn sign_challenge(&self, digest: &[u8]) -> Result<ecdsa::Signature>;
}

/// 硬件命令
#[derive(Debug, Clone)]
pub enum HardwareCommand {
    SignTransaction(SigningPayload),
    SignChallenge(Vec<u8>),
}

impl HardwareCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignTransaction(_) => "sign_transaction",
            Self::SignChallenge(_) => "sign_challenge",
        }
    }
}

/// 硬件响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareResponse {
    TransactionSignatures(Vec<ecdsa::Signature>),
    ChallengeSignature(ecdsa::Signature),
}

/// 拦截器链中每一层的统一服务类型
pub type HardwareService = BoxCloneService<HardwareCommand, HardwareResponse, CustodyError>;

/// 拦截器
#[async_trait]
pub trait HardwareInterceptor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// 处理命令；调用 `next.run(command)` 进入内层
    async fn intercept(&self, command: HardwareCommand, next: Next) -> Result<HardwareResponse>;
}

/// 内层链的句柄
#[derive(Clone)]
pub struct Next {
    inner: HardwareService,
}

impl Next {
    pub async fn run(self, command: HardwareCommand) -> Result<HardwareResponse> {
        self.inner.oneshot(command).await
    }
}

/// 最内层：直接调用硬件
#[derive(Clone)]
struct RawHardware {
    commands: Arc<dyn NfcCommands>,
}

impl Service<HardwareCommand> for RawHardware {
    type Response = HardwareResponse;
    type Error = CustodyError;
    type Future = BoxFuture<'static, Result<HardwareResponse>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, command: HardwareCommand) -> Self::Future {
        let commands = Arc::clone(&self.commands);
        Box::pin(async move {
            match command {
                HardwareCommand::SignTransaction(payload) => commands
                    .sign(&payload)
                    .await
                    .map(HardwareResponse::TransactionSignatures),
                HardwareCommand::SignChallenge(digest) => commands
                    .sign_challenge(&digest)
                    .await
                    .map(HardwareResponse::ChallengeSignature),
            }
        })
    }
}

/// 拦截器包装的一层
#[derive(Clone)]
struct Intercepted {
    interceptor: Arc<dyn HardwareInterceptor>,
    inner: HardwareService,
}

impl Service<HardwareCommand> for Intercepted {
    type Response = HardwareResponse;
    type Error = CustodyError;
    type Future = BoxFuture<'static, Result<HardwareResponse>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        // 内层在 Next::run 中通过 oneshot 驱动就绪
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, command: HardwareCommand) -> Self::Future {
        let interceptor = Arc::clone(&self.interceptor);
        let next = Next {
            inner: self.inner.clone(),
        };
        Box::pin(async move { interceptor.intercept(command, next).await })
    }
}

/// 构建拦截器链
pub struct HardwareChannelBuilder {
    commands: Arc<dyn NfcCommands>,
    interceptors: Vec<Arc<dyn HardwareInterceptor>>,
}

impl HardwareChannelBuilder {
    /// 追加拦截器（越晚注册越靠内）
    pub fn with<I: HardwareInterceptor>(mut self, interceptor: I) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn build(self) -> HardwareChannel {
        let names = self.interceptors.iter().map(|i| i.name()).collect();

        let raw = BoxCloneService::new(RawHardware {
            commands: Arc::clone(&self.commands),
        });
        let service = self
            .interceptors
            .into_iter()
            .rev()
            .fold(raw, |inner, interceptor| {
                BoxCloneService::new(Intercepted { interceptor, inner })
            });

        HardwareChannel {
            service: Arc::new(Mutex::new(service)),
            device: Arc::new(AsyncMutex::new(())),
            commands: self.commands,
            names,
        }
    }
}

/// 硬件交易通道
#[derive(Clone)]
pub struct HardwareChannel {
    // BoxCloneService 不是 Sync，克隆时短暂加锁
    service: Arc<Mutex<HardwareService>>,
    // 设备独占：整条链执行期间持有
    device: Arc<AsyncMutex<()>>,
    commands: Arc<dyn NfcCommands>,
    names: Vec<&'static str>,
}

impl HardwareChannel {
    pub fn builder(commands: Arc<dyn NfcCommands>) -> HardwareChannelBuilder {
        HardwareChannelBuilder {
            commands,
            interceptors: Vec::new(),
        }
    }

    /// 默认链：logging → retry → session → timeout
    ///
    /// 重试在会话外层：断连后的每次重试都重新建立会话。
    pub fn from_config(commands: Arc<dyn NfcCommands>, config: &HardwareConfig) -> Self {
        Self::builder(Arc::clone(&commands))
            .with(LoggingInterceptor)
            .with(RetryInterceptor::new(config.max_retries, config.retry_backoff()))
            .with(SessionInterceptor::new(commands))
            .with(TimeoutInterceptor::new(config.user_timeout()))
            .build()
    }

    fn service(&self) -> HardwareService {
        match self.service.lock() {
            Ok(service) => service.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 拦截器名称（由外到内）
    pub fn interceptor_names(&self) -> &[&'static str] {
        &self.names
    }

    pub fn commands(&self) -> &Arc<dyn NfcCommands> {
        &self.commands
    }

    /// 经拦截器链执行命令
    ///
    /// 命令先获取设备独占锁再进入链，等待锁同样可被取消。
    /// 取消与链并发竞争：一旦取消，链与锁一并被丢弃（会话守卫负责释放会话），
    /// 返回 `UserCancelled`。
    pub async fn execute(
        &self,
        command: HardwareCommand,
        cancel: &SigningCancellation,
    ) -> Result<HardwareResponse> {
        if cancel.is_cancelled() {
            return Err(CustodyError::hardware(HardwareFailureReason::UserCancelled));
        }

        let kind = command.kind();
        let device = Arc::clone(&self.device);
        let service = self.service();
        let call = async move {
            let _device = device.lock_owned().await;
            service.oneshot(command).await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(command = kind, "Hardware command cancelled by user");
                Err(CustodyError::hardware(HardwareFailureReason::UserCancelled))
            }
            result = call => result,
        }
    }

    pub async fn sign_transaction(
        &self,
        payload: SigningPayload,
        cancel: &SigningCancellation,
    ) -> Result<Vec<ecdsa::Signature>> {
        let expected = payload.len();
        match self
            .execute(HardwareCommand::SignTransaction(payload), cancel)
            .await?
        {
            HardwareResponse::TransactionSignatures(sigs) if sigs.len() == expected => Ok(sigs),
            other => {
                tracing::warn!(response = ?other, expected, "Unexpected hardware response");
                Err(CustodyError::hardware(
                    HardwareFailureReason::FirmwareRejected,
                ))
            }
        }
    }

    pub async fn sign_challenge(
        &self,
        digest: Vec<u8>,
        cancel: &SigningCancellation,
    ) -> Result<ecdsa::Signature> {
        match self
            .execute(HardwareCommand::SignChallenge(digest), cancel)
            .await?
        {
            HardwareResponse::ChallengeSignature(sig) => Ok(sig),
            other => {
                tracing::warn!(response = ?other, "Unexpected hardware response");
                Err(CustodyError::hardware(
                    HardwareFailureReason::FirmwareRejected,
                ))
            }
        }
    }
}
