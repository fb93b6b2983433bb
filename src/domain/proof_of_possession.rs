//! 硬件因子持有证明
//!
//! 每个认证会话签发一次，交给服务端信任边界后即被消费，不可跨会话复用。

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// 硬件对访问令牌哈希的签名
///
/// 不实现 Clone：`into_token` 按值消费，保证单次使用。
pub struct HwFactorProofOfPossession {
    session_id: Uuid,
    hw_signed_token: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl HwFactorProofOfPossession {
    pub(crate) fn new(session_id: Uuid, hw_signed_token: Vec<u8>) -> Self {
        Self {
            session_id,
            hw_signed_token,
            created_at: Utc::now(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// 消费证明，返回 DER 编码签名
    pub fn into_token(self) -> Vec<u8> {
        self.hw_signed_token
    }

    /// 十六进制编码后交给服务端
    pub fn into_hex(self) -> String {
        hex::encode(self.into_token())
    }
}

impl fmt::Debug for HwFactorProofOfPossession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwFactorProofOfPossession")
            .field("session_id", &self.session_id)
            .field(
                "hw_signed_token",
                &crate::infrastructure::log_redact::redact_token(&hex::encode(
                    &self.hw_signed_token,
                )),
            )
            .field("created_at", &self.created_at)
            .finish()
    }
}
