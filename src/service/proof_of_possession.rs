//! 硬件因子持有证明：签发与校验
//!
//! 签发：硬件经拦截器链对 `sha256(access_token)` 签名，每次签发绑定一个新的会话 id。
//! 校验：确定性、无网络、无副作用；任何解析失败都视为校验失败（fail closed）。

use bitcoin::secp256k1::{ecdsa, Message, PublicKey};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::keys::SECP;
use crate::domain::proof_of_possession::HwFactorProofOfPossession;
use crate::error::Result;
use crate::infrastructure::cancellation::SigningCancellation;
use crate::infrastructure::log_redact::redact_hex_string;
use crate::service::hardware_channel::HardwareChannel;

/// 访问令牌摘要
fn token_digest(token: &[u8]) -> [u8; 32] {
    Sha256::digest(token).into()
}

pub struct ProofOfPossessionIssuer;

impl ProofOfPossessionIssuer {
    pub async fn issue(
        channel: &HardwareChannel,
        access_token: &str,
        cancel: &SigningCancellation,
    ) -> Result<HwFactorProofOfPossession> {
        let session_id = Uuid::new_v4();
        let digest = token_digest(access_token.as_bytes());

        let signature = channel.sign_challenge(digest.to_vec(), cancel).await?;

        tracing::info!(
            session_id = %session_id,
            token_digest = %redact_hex_string(&hex::encode(digest), 6),
            "Hardware proof of possession issued"
        );
        Ok(HwFactorProofOfPossession::new(
            session_id,
            signature.serialize_der().to_vec(),
        ))
    }
}

pub struct ProofOfPossessionVerifier;

impl ProofOfPossessionVerifier {
    /// 校验硬件对令牌哈希的签名
    ///
    /// 签名接受 DER 或 64 字节 compact 编码。空令牌、空签名、编码错误都返回 false。
    pub fn verify(token: &str, signature: &[u8], hardware_key: &PublicKey) -> bool {
        if token.is_empty() || signature.is_empty() {
            return false;
        }

        let signature = match Self::parse_signature(signature) {
            Some(signature) => signature,
            None => return false,
        };

        let message = Message::from_digest(token_digest(token.as_bytes()));
        SECP.verify_ecdsa(&message, &signature, hardware_key).is_ok()
    }

    /// 十六进制编码的签名与公钥
    pub fn verify_hex(token: &str, signature_hex: &str, hardware_key_hex: &str) -> bool {
        let signature = match hex::decode(signature_hex.trim()) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let key = match hex::decode(hardware_key_hex.trim())
            .ok()
            .and_then(|bytes| PublicKey::from_slice(&bytes).ok())
        {
            Some(key) => key,
            None => return false,
        };
        Self::verify(token, &signature, &key)
    }

    fn parse_signature(bytes: &[u8]) -> Option<ecdsa::Signature> {
        let mut signature = if bytes.len() == 64 {
            ecdsa::Signature::from_compact(bytes).ok()?
        } else {
            ecdsa::Signature::from_der(bytes).ok()?
        };
        // 高 S 签名按低 S 规范化后再校验
        signature.normalize_s();
        Some(signature)
    }
}
