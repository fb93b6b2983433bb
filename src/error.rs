//! 托管核心错误类型
//!
//! 所有错误均以显式 Result 返回，不做静默吞掉。
//! `code()` 提供稳定的错误码，供上层（UI / 服务端边界）映射。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::signing_factor::SigningFactor;

/// 硬件签名失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareFailureReason {
    /// NFC 连接断开
    Disconnected,
    /// 等待设备/用户超时
    Timeout,
    /// 用户取消
    UserCancelled,
    /// 固件拒绝签名
    FirmwareRejected,
}

impl HardwareFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Timeout => "timeout",
            Self::UserCancelled => "user_cancelled",
            Self::FirmwareRejected => "firmware_rejected",
        }
    }

    /// 瞬时错误：提示用户后可重试
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Timeout)
    }
}

impl fmt::Display for HardwareFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 托管核心错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CustodyError {
    /// 熵或派生失败
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// 因子集合不符合模板
    #[error("incomplete factor set: missing {missing:?}, unexpected {unexpected:?}")]
    IncompleteFactorSet {
        missing: Vec<SigningFactor>,
        unexpected: Vec<SigningFactor>,
    },

    /// 公钥无法通过曲线/编码校验
    #[error("malformed key for {factor}: {reason}")]
    MalformedKey {
        factor: SigningFactor,
        reason: String,
    },

    /// 硬件签名失败
    #[error("hardware signing failed: {reason}")]
    HardwareSigning { reason: HardwareFailureReason },

    /// 部分签名与期望公钥不匹配
    #[error("signature mismatch for {factor} on input {input_index}")]
    SignatureMismatch {
        factor: SigningFactor,
        input_index: usize,
    },

    /// 待签交易不符合描述符
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// 服务端联签失败
    #[error("server cosigning failed: {0}")]
    ServerCosign(String),

    /// 同一钱包已有签名流程在进行
    #[error("signing already in progress for wallet {wallet_id}")]
    SigningInProgress { wallet_id: String },

    /// 非法状态转换
    #[error("invalid signing state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// 密钥不在存储中
    #[error("key not found in key material store")]
    KeyNotFound,

    #[error("configuration error: {0}")]
    Config(String),
}

impl CustodyError {
    pub fn hardware(reason: HardwareFailureReason) -> Self {
        Self::HardwareSigning { reason }
    }

    pub fn malformed_key(factor: SigningFactor, reason: impl Into<String>) -> Self {
        Self::MalformedKey {
            factor,
            reason: reason.into(),
        }
    }

    pub fn invalid_transaction(msg: impl Into<String>) -> Self {
        Self::InvalidTransaction(msg.into())
    }

    /// 稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::KeyGeneration(_) => "key_generation",
            Self::IncompleteFactorSet { .. } => "incomplete_factor_set",
            Self::MalformedKey { .. } => "malformed_key",
            Self::HardwareSigning { .. } => "hardware_signing",
            Self::SignatureMismatch { .. } => "signature_mismatch",
            Self::InvalidTransaction(_) => "invalid_transaction",
            Self::ServerCosign(_) => "server_cosign",
            Self::SigningInProgress { .. } => "signing_in_progress",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::KeyNotFound => "key_not_found",
            Self::Config(_) => "config",
        }
    }

    /// 是否允许（在用户确认后）重试
    ///
    /// 签名不匹配永远不重试：意味着密钥状态损坏或被篡改。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HardwareSigning { reason } => reason.is_transient(),
            Self::SigningInProgress { .. } => true,
            Self::ServerCosign(_) => true,
            _ => false,
        }
    }

    /// 硬件失败原因（如有）
    pub fn hardware_reason(&self) -> Option<HardwareFailureReason> {
        match self {
            Self::HardwareSigning { reason } => Some(*reason),
            _ => None,
        }
    }
}

impl From<bip39::Error> for CustodyError {
    fn from(err: bip39::Error) -> Self {
        Self::KeyGeneration(format!("mnemonic: {}", err))
    }
}

impl From<bitcoin::bip32::Error> for CustodyError {
    fn from(err: bitcoin::bip32::Error) -> Self {
        Self::KeyGeneration(format!("bip32: {}", err))
    }
}

pub type Result<T, E = CustodyError> = std::result::Result<T, E>;
