//! 部分签名与硬件签名载荷

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{ecdsa, Message, PublicKey};

use crate::domain::descriptor::WalletId;
use crate::domain::keys::{Keychain, SECP};
use crate::domain::signing_factor::SigningFactor;

/// 单个输入的待签摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SighashItem {
    pub input_index: usize,
    pub keychain: Keychain,
    pub derivation_index: u32,
    /// BIP-143 摘要
    pub sighash: Message,
}

/// 某一因子对某一输入的部分签名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSignature {
    pub factor: SigningFactor,
    pub input_index: usize,
    pub signature: ecdsa::Signature,
}

impl PartialSignature {
    /// 低 S 形式（libsecp 只接受低 S，见证也要求低 S 才能标准转发）
    pub fn normalized(mut self) -> Self {
        self.signature.normalize_s();
        self
    }

    /// 用期望公钥校验签名，高 S 签名按低 S 校验
    pub fn verify(&self, sighash: &Message, expected: &PublicKey) -> bool {
        let mut signature = self.signature;
        signature.normalize_s();
        SECP.verify_ecdsa(sighash, &signature, expected).is_ok()
    }
}

/// 交给硬件的签名请求
///
/// 携带完整 PSBT 供固件展示和核对，以及逐输入的派生路径与摘要。
#[derive(Debug, Clone, PartialEq)]
pub struct SigningPayload {
    pub wallet_id: WalletId,
    pub psbt: Psbt,
    pub master_fingerprint: Fingerprint,
    pub items: Vec<HardwareSighash>,
}

/// 硬件侧单个摘要：完整派生路径 + 摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareSighash {
    pub input_index: usize,
    pub path: DerivationPath,
    pub sighash: Message,
}

impl SigningPayload {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
