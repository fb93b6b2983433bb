//! 钱包描述符模型
//!
//! WatchingDescriptor 只包含公钥，可以安全地交给任何协作方（包括服务端）。
//! SpendingDescriptor 额外持有 App 私钥的签名能力引用，不可序列化，不得跨进程/网络边界。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bitcoin::bip32::{DerivationPath, Xpub};
use bitcoin::psbt;
use bitcoin::secp256k1::{ecdsa, Message, PublicKey};
use bitcoin::{Address, Network, ScriptBuf};
use miniscript::descriptor::{DefiniteDescriptorKey, Descriptor, DescriptorPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::domain::keys::{DescriptorKey, Keychain};
use crate::domain::signing_factor::{DescriptorTemplate, SigningFactor};
use crate::error::{CustodyError, Result};

/// 钱包标识：接收描述符 SHA-256 的前 16 字节
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WalletId(String);

impl WalletId {
    /// 从持久化层恢复
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 可对外共享的描述符记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchingDescriptorRecord {
    pub wallet_id: WalletId,
    pub template: DescriptorTemplate,
    pub network: Network,
    pub receive: String,
    pub change: String,
    pub keys: BTreeMap<SigningFactor, String>,
}

/// 观察描述符（纯公钥）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchingDescriptor {
    template: DescriptorTemplate,
    network: Network,
    keys: BTreeMap<SigningFactor, DescriptorKey>,
    receive: Descriptor<DescriptorPublicKey>,
    change: Descriptor<DescriptorPublicKey>,
}

/// 去掉 `#checksum` 后缀
fn strip_checksum(descriptor: &str) -> &str {
    descriptor
        .split_once('#')
        .map(|(body, _)| body)
        .unwrap_or(descriptor)
        .trim()
}

impl WatchingDescriptor {
    /// 由描述符构建器调用，调用方已校验因子集合与公钥
    pub(crate) fn new(
        template: DescriptorTemplate,
        network: Network,
        keys: BTreeMap<SigningFactor, DescriptorKey>,
    ) -> Result<Self> {
        let build = |keychain: Keychain| -> Result<Descriptor<DescriptorPublicKey>> {
            let pks = keys
                .values()
                .map(|key| key.to_descriptor_public_key(keychain))
                .collect::<Vec<_>>();
            Descriptor::new_wsh_sortedmulti(template.threshold(), pks).map_err(|e| {
                CustodyError::malformed_key(SigningFactor::AppKey, format!("descriptor: {}", e))
            })
        };

        let receive = build(Keychain::External)?;
        let change = build(Keychain::Internal)?;

        Ok(Self {
            template,
            network,
            keys,
            receive,
            change,
        })
    }

    pub fn template(&self) -> DescriptorTemplate {
        self.template
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn threshold(&self) -> usize {
        self.template.threshold()
    }

    pub fn key(&self, factor: SigningFactor) -> Option<&DescriptorKey> {
        self.keys.get(&factor)
    }

    pub fn keys(&self) -> &BTreeMap<SigningFactor, DescriptorKey> {
        &self.keys
    }

    pub fn descriptor(&self, keychain: Keychain) -> &Descriptor<DescriptorPublicKey> {
        match keychain {
            Keychain::External => &self.receive,
            Keychain::Internal => &self.change,
        }
    }

    /// 接收描述符文本（含 BIP-380 校验和）
    pub fn receive_descriptor(&self) -> String {
        self.receive.to_string()
    }

    /// 找零描述符文本（含 BIP-380 校验和）
    pub fn change_descriptor(&self) -> String {
        self.change.to_string()
    }

    pub fn wallet_id(&self) -> WalletId {
        let digest = Sha256::digest(self.receive_descriptor().as_bytes());
        WalletId(hex::encode(&digest[..16]))
    }

    /// 与服务端上报的描述符比对（忽略校验和，常量时间比较）
    pub fn matches_server_descriptor(&self, reported: &str) -> bool {
        let ours = self.receive_descriptor();
        let ours = strip_checksum(&ours).as_bytes();
        let theirs = strip_checksum(reported).as_bytes();
        ours.len() == theirs.len() && bool::from(ours.ct_eq(theirs))
    }

    fn definite(
        &self,
        keychain: Keychain,
        index: u32,
    ) -> Result<Descriptor<DefiniteDescriptorKey>> {
        self.descriptor(keychain)
            .at_derivation_index(index)
            .map_err(|e| CustodyError::invalid_transaction(format!("derive descriptor: {}", e)))
    }

    /// 见证脚本（sortedmulti）
    pub fn witness_script(&self, keychain: Keychain, index: u32) -> Result<ScriptBuf> {
        self.definite(keychain, index)?
            .explicit_script()
            .map_err(|e| CustodyError::invalid_transaction(format!("witness script: {}", e)))
    }

    pub fn script_pubkey(&self, keychain: Keychain, index: u32) -> Result<ScriptBuf> {
        Ok(self.definite(keychain, index)?.script_pubkey())
    }

    pub fn address(&self, keychain: Keychain, index: u32) -> Result<Address> {
        self.definite(keychain, index)?
            .address(self.network)
            .map_err(|e| CustodyError::invalid_transaction(format!("address: {}", e)))
    }

    /// 某一派生位置上的规范公钥顺序（与 sortedmulti 脚本中的顺序一致）
    pub fn canonical_keys(
        &self,
        keychain: Keychain,
        index: u32,
    ) -> Result<Vec<(SigningFactor, PublicKey)>> {
        let mut derived = self
            .keys
            .iter()
            .map(|(factor, key)| Ok((*factor, key.derive_child(keychain, index)?)))
            .collect::<Result<Vec<_>>>()?;
        derived.sort_by(|a, b| a.1.serialize().cmp(&b.1.serialize()));
        Ok(derived)
    }

    /// 为 PSBT 输入填充见证脚本和 bip32 派生信息
    pub fn update_psbt_input(
        &self,
        input: &mut psbt::Input,
        keychain: Keychain,
        index: u32,
    ) -> Result<()> {
        input.witness_script = Some(self.witness_script(keychain, index)?);
        for key in self.keys.values() {
            let child = key.derive_child(keychain, index)?;
            input.bip32_derivation.insert(
                child,
                (key.master_fingerprint, key.full_path(keychain, index)?),
            );
        }
        Ok(())
    }

    /// 从 PSBT 输入的 bip32 派生信息定位 keychain / index
    pub fn locate_input(&self, input: &psbt::Input) -> Result<(Keychain, u32)> {
        for (fingerprint, path) in input.bip32_derivation.values() {
            for key in self.keys.values() {
                if *fingerprint != key.master_fingerprint {
                    continue;
                }
                if let Some(found) = Self::split_path(&key.origin_path, path) {
                    return Ok(found);
                }
            }
        }
        Err(CustodyError::invalid_transaction(
            "input does not belong to this wallet",
        ))
    }

    fn split_path(origin: &DerivationPath, full: &DerivationPath) -> Option<(Keychain, u32)> {
        let origin: &[_] = origin.as_ref();
        let full: &[_] = full.as_ref();
        if full.len() != origin.len() + 2 || !full.starts_with(origin) {
            return None;
        }
        let keychain = match full[origin.len()] {
            bitcoin::bip32::ChildNumber::Normal { index } => Keychain::from_index(index)?,
            _ => return None,
        };
        match full[origin.len() + 1] {
            bitcoin::bip32::ChildNumber::Normal { index } => Some((keychain, index)),
            _ => None,
        }
    }

    pub fn to_record(&self) -> WatchingDescriptorRecord {
        WatchingDescriptorRecord {
            wallet_id: self.wallet_id(),
            template: self.template,
            network: self.network,
            receive: self.receive_descriptor(),
            change: self.change_descriptor(),
            keys: self
                .keys
                .iter()
                .map(|(factor, key)| (*factor, key.to_string()))
                .collect(),
        }
    }
}

impl fmt::Display for WatchingDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.receive, f)
    }
}

/// App 私钥签名能力（函数式回调）
///
/// 私钥本身留在密钥存储中，持有者只能请求签名。
pub trait AppKeySigner: Send + Sync {
    fn account_xpub(&self) -> Xpub;

    fn sign(&self, keychain: Keychain, index: u32, sighash: &Message) -> Result<ecdsa::Signature>;
}

/// 支出描述符：观察描述符 + App 私钥签名能力引用
///
/// 不实现 Serialize，也不实现 Clone 之外的任何导出。
#[derive(Clone)]
pub struct SpendingDescriptor {
    watching: WatchingDescriptor,
    app_signer: Arc<dyn AppKeySigner>,
}

impl SpendingDescriptor {
    pub(crate) fn new(watching: WatchingDescriptor, app_signer: Arc<dyn AppKeySigner>) -> Self {
        Self {
            watching,
            app_signer,
        }
    }

    pub fn watching(&self) -> &WatchingDescriptor {
        &self.watching
    }

    pub fn wallet_id(&self) -> WalletId {
        self.watching.wallet_id()
    }

    pub(crate) fn app_signer(&self) -> &Arc<dyn AppKeySigner> {
        &self.app_signer
    }
}

impl fmt::Debug for SpendingDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpendingDescriptor")
            .field("wallet_id", &self.watching.wallet_id())
            .field("app_signer", &"[capability]")
            .finish()
    }
}
