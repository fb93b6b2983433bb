//! 日志脱敏
//! 私钥、种子、完整令牌不得出现在任何日志行中

use serde::Serialize;

use crate::domain::descriptor::{SpendingDescriptor, WatchingDescriptor};
use crate::domain::keys::{DescriptorKey, ExtendedKeyPair};

/// 可脱敏trait
pub trait SensitiveRedact {
    fn redact(&self) -> String;
}

/// 脱敏十六进制字符串（显示前缀和后缀）
pub fn redact_hex_string(hex: &str, show_chars: usize) -> String {
    if hex.len() <= show_chars * 2 {
        return "*".repeat(hex.len());
    }

    let prefix = &hex[..show_chars];
    let suffix = &hex[hex.len() - show_chars..];
    format!("{}...{}", prefix, suffix)
}

/// 脱敏扩展公钥（保留版本前缀和末尾 6 位）
pub fn redact_xpub(xpub: &str) -> String {
    if xpub.len() < 16 {
        return "*".repeat(xpub.len());
    }

    format!("{}...{}", &xpub[..8], &xpub[xpub.len() - 6..])
}

/// 脱敏令牌：只保留长度信息
pub fn redact_token(token: &str) -> String {
    format!("<redacted {} chars>", token.len())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 为密钥与描述符类型实现脱敏
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 密钥对脱敏视图
#[derive(Debug, Serialize)]
pub struct RedactedKeyPair {
    pub fingerprint: String,
    pub path: String,
    pub xpub: String,
    // ❌ 不包含：xpriv
}

impl SensitiveRedact for ExtendedKeyPair {
    fn redact(&self) -> String {
        serde_json::to_string(&RedactedKeyPair {
            fingerprint: self.master_fingerprint().to_string(),
            path: self.derivation_path().to_string(),
            xpub: redact_xpub(&self.xpub().to_string()),
        })
        .unwrap_or_else(|_| "{ redacted }".to_string())
    }
}

impl SensitiveRedact for DescriptorKey {
    fn redact(&self) -> String {
        format!(
            "[{}/{}]{}",
            self.master_fingerprint,
            self.origin_path,
            redact_xpub(&self.xpub.to_string())
        )
    }
}

/// 描述符脱敏视图
#[derive(Debug, Serialize)]
pub struct RedactedDescriptor {
    pub wallet_id: String,
    pub template: String,
    pub network: String,
}

impl SensitiveRedact for WatchingDescriptor {
    fn redact(&self) -> String {
        serde_json::to_string(&RedactedDescriptor {
            wallet_id: self.wallet_id().to_string(),
            template: format!("{:?}", self.template()),
            network: self.network().to_string(),
        })
        .unwrap_or_else(|_| "{ redacted }".to_string())
    }
}

impl SensitiveRedact for SpendingDescriptor {
    fn redact(&self) -> String {
        self.watching().redact()
    }
}
