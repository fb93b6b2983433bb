//! 签名流程状态机
//! 严格的状态转换：非法转换返回错误，不做隐式修正

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::signing_factor::SigningFactor;
use crate::error::{CustodyError, HardwareFailureReason};

/// 失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum FailureReason {
    Hardware(HardwareFailureReason),
    SignatureMismatch,
    ServerCosign,
    /// App 密钥缺失或损坏
    AppKey,
    /// 交易或因子输入不符合描述符
    InvalidInput,
    /// 钱包已有进行中的签名或状态冲突
    Conflict,
    Configuration,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hardware(reason) => reason.as_str(),
            Self::SignatureMismatch => "signature_mismatch",
            Self::ServerCosign => "server_cosign",
            Self::AppKey => "app_key",
            Self::InvalidInput => "invalid_input",
            Self::Conflict => "conflict",
            Self::Configuration => "configuration",
        }
    }

    /// 由错误推导失败原因
    pub fn from_error(err: &CustodyError) -> Self {
        match err {
            CustodyError::HardwareSigning { reason } => Self::Hardware(*reason),
            CustodyError::SignatureMismatch { .. } => Self::SignatureMismatch,
            CustodyError::ServerCosign(_) => Self::ServerCosign,
            CustodyError::KeyGeneration(_) | CustodyError::KeyNotFound => Self::AppKey,
            CustodyError::MalformedKey { factor, .. } if *factor == SigningFactor::AppKey => {
                Self::AppKey
            }
            CustodyError::MalformedKey { .. }
            | CustodyError::IncompleteFactorSet { .. }
            | CustodyError::InvalidTransaction(_) => Self::InvalidInput,
            CustodyError::SigningInProgress { .. } | CustodyError::InvalidStateTransition { .. } => {
                Self::Conflict
            }
            CustodyError::Config(_) => Self::Configuration,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次签名尝试的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningState {
    /// 收集部分签名
    Collecting,
    /// 已调用硬件签名回调，等待设备
    HardwarePending,
    /// 所需因子都已提供有效部分签名
    Ready,
    /// 已组装为可广播交易
    Finalized,
    Failed(FailureReason),
}

impl SigningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::HardwarePending => "hardware_pending",
            Self::Ready => "ready",
            Self::Finalized => "finalized",
            Self::Failed(_) => "failed",
        }
    }

    /// 终态：不再接受签名
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed(_))
    }

    /// 验证状态转换是否合法
    pub fn can_transition(from: SigningState, to: SigningState) -> bool {
        use SigningState::*;

        matches!(
            (from, to),
            // 正常流程
            (Collecting, HardwarePending)
            | (HardwarePending, Collecting)
            | (Collecting, Ready)
            | (Ready, Finalized)

            // 失败分支
            | (Collecting, Failed(_))
            | (HardwarePending, Failed(_))
            | (Ready, Failed(_))
        )
    }

    /// 执行转换，非法转换返回 `InvalidStateTransition`
    pub fn transition(&mut self, to: SigningState) -> Result<(), CustodyError> {
        if !Self::can_transition(*self, to) {
            return Err(CustodyError::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for SigningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = SigningState::Collecting;
        state.transition(SigningState::HardwarePending).unwrap();
        state.transition(SigningState::Collecting).unwrap();
        state.transition(SigningState::Ready).unwrap();
        state.transition(SigningState::Finalized).unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn test_finalized_is_terminal() {
        let mut state = SigningState::Finalized;
        let err = state.transition(SigningState::Collecting).unwrap_err();
        assert_eq!(err.code(), "invalid_state_transition");
        assert_eq!(state, SigningState::Finalized);
    }

    #[test]
    fn test_cannot_skip_to_finalized() {
        assert!(!SigningState::can_transition(
            SigningState::Collecting,
            SigningState::Finalized
        ));
        assert!(!SigningState::can_transition(
            SigningState::HardwarePending,
            SigningState::Ready
        ));
    }

    #[test]
    fn test_failure_display() {
        let state = SigningState::Failed(FailureReason::Hardware(
            HardwareFailureReason::UserCancelled,
        ));
        assert_eq!(state.to_string(), "failed(user_cancelled)");
        assert!(state.is_terminal());
    }

    #[test]
    fn test_failure_reason_follows_error_kind() {
        let cases = [
            (CustodyError::KeyNotFound, FailureReason::AppKey),
            (
                CustodyError::malformed_key(SigningFactor::AppKey, "bad"),
                FailureReason::AppKey,
            ),
            (
                CustodyError::malformed_key(SigningFactor::Hardware, "bad"),
                FailureReason::InvalidInput,
            ),
            (
                CustodyError::InvalidTransaction("bad sighash".into()),
                FailureReason::InvalidInput,
            ),
            (
                CustodyError::SigningInProgress {
                    wallet_id: "w".into(),
                },
                FailureReason::Conflict,
            ),
            (
                CustodyError::Config("no hardware channel".into()),
                FailureReason::Configuration,
            ),
            (
                CustodyError::ServerCosign("rejected".into()),
                FailureReason::ServerCosign,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(FailureReason::from_error(&err), expected, "{err}");
        }
    }
}
