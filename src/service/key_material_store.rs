//! 密钥材料存储
//!
//! 唯一持有私钥标量的组件。其他组件最多拿到 `AppKeyCapability`
//! （只能请求签名的能力句柄），私钥字节不会离开 `sign` 调用。
//!
//! 生成的密钥不会被隐式缓存或持久化：`generate` 每次返回独立的密钥对，
//! 是否纳入存储（`import`）以及是否持久化（`export_for_storage`）由调用方决定。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bip39::{Language, Mnemonic};
use bitcoin::bip32::{ChainCode, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{ecdsa, Message, PublicKey};
use bitcoin::Network;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::domain::descriptor::AppKeySigner;
use crate::domain::keys::{
    bip84_account_path, is_same_network_kind, relative_path, ExtendedKeyPair, Keychain, SECP,
};
use crate::error::{CustodyError, Result};
use crate::infrastructure::log_redact::SensitiveRedact;

/// BIP-39 熵长度（24 词）
const ENTROPY_BYTES: usize = 32;

/// 存储键：公钥 + 链码，不含网络前缀
type AccountId = (PublicKey, ChainCode);

fn account_id(xpub: &Xpub) -> AccountId {
    (xpub.public_key, xpub.chain_code)
}

#[derive(Default)]
pub struct KeyMaterialStore {
    keys: RwLock<HashMap<AccountId, ExtendedKeyPair>>,
}

impl KeyMaterialStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<AccountId, ExtendedKeyPair>> {
        match self.keys.read() {
            Ok(keys) => keys,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<AccountId, ExtendedKeyPair>> {
        match self.keys.write() {
            Ok(keys) => keys,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 生成新的 BIP-84 账户密钥对（系统熵）
    pub fn generate(network: Network) -> Result<ExtendedKeyPair> {
        let (pair, _mnemonic) = Self::generate_with_mnemonic(network)?;
        Ok(pair)
    }

    /// 生成密钥对并返回助记词（供备份流程展示）
    pub fn generate_with_mnemonic(
        network: Network,
    ) -> Result<(ExtendedKeyPair, Zeroizing<String>)> {
        let mut entropy = Zeroizing::new([0u8; ENTROPY_BYTES]);
        OsRng
            .try_fill_bytes(&mut entropy[..])
            .map_err(|e| CustodyError::KeyGeneration(format!("entropy: {}", e)))?;

        let mnemonic = Mnemonic::from_entropy(&entropy[..])?;
        let phrase = Zeroizing::new(mnemonic.to_string());
        let pair = Self::from_mnemonic(&mnemonic, network)?;
        Ok((pair, phrase))
    }

    /// 由给定熵确定性地派生（相同熵 → 相同密钥对）
    pub fn generate_from_entropy(entropy: &[u8], network: Network) -> Result<ExtendedKeyPair> {
        let mnemonic = Mnemonic::from_entropy(entropy)?;
        Self::from_mnemonic(&mnemonic, network)
    }

    /// 从助记词恢复
    pub fn restore_from_mnemonic(phrase: &str, network: Network) -> Result<ExtendedKeyPair> {
        let mnemonic = Mnemonic::parse_in(Language::English, phrase)?;
        Self::from_mnemonic(&mnemonic, network)
    }

    fn from_mnemonic(mnemonic: &Mnemonic, network: Network) -> Result<ExtendedKeyPair> {
        let seed = Zeroizing::new(mnemonic.to_seed(""));
        let mut master = Xpriv::new_master(network, &seed[..])?;
        let pair = ExtendedKeyPair::from_master(&master, bip84_account_path(network, 0)?);
        master.private_key.non_secure_erase();
        let pair = pair?;

        tracing::debug!(
            fingerprint = %pair.master_fingerprint(),
            path = %pair.derivation_path(),
            network = %network,
            "Derived account key pair"
        );
        Ok(pair)
    }

    /// 将密钥对纳入存储，返回签名能力句柄
    pub fn import(self: &Arc<Self>, pair: ExtendedKeyPair) -> Result<AppKeyCapability> {
        if !pair.verify_consistency() {
            return Err(CustodyError::KeyGeneration(
                "private key does not match public key".into(),
            ));
        }

        let xpub = *pair.xpub();
        tracing::info!(key = %pair.redact(), "Key pair imported");
        self.write().insert(account_id(&xpub), pair);

        Ok(AppKeyCapability {
            store: Arc::clone(self),
            xpub,
        })
    }

    /// 已存储密钥的签名能力句柄
    pub fn capability(self: &Arc<Self>, xpub: &Xpub) -> Result<AppKeyCapability> {
        if !self.contains(xpub) {
            return Err(CustodyError::KeyNotFound);
        }
        Ok(AppKeyCapability {
            store: Arc::clone(self),
            xpub: *xpub,
        })
    }

    pub fn contains(&self, xpub: &Xpub) -> bool {
        self.read().contains_key(&account_id(xpub))
    }

    pub fn remove(&self, xpub: &Xpub) -> bool {
        self.write().remove(&account_id(xpub)).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 导出给持久化层：`[fingerprint/path]xprv`
    pub fn export_for_storage(&self, xpub: &Xpub) -> Result<Zeroizing<String>> {
        let keys = self.read();
        let pair = keys
            .get(&account_id(xpub))
            .ok_or(CustodyError::KeyNotFound)?;
        let path = pair.derivation_path().to_string();
        Ok(Zeroizing::new(format!(
            "[{}/{}]{}",
            pair.master_fingerprint(),
            path.trim_start_matches("m/"),
            pair.xpriv()
        )))
    }

    /// 从持久化层的导出文本恢复密钥对
    ///
    /// `tprv` 不区分 Testnet / Regtest / Signet，网络由调用方给出。
    pub fn restore_from_storage(exported: &str, network: Network) -> Result<ExtendedKeyPair> {
        let invalid = || CustodyError::KeyGeneration("malformed stored key".into());

        let rest = exported.trim().strip_prefix('[').ok_or_else(invalid)?;
        let (origin, xpriv) = rest.split_once(']').ok_or_else(invalid)?;
        let (fingerprint, path) = origin.split_once('/').ok_or_else(invalid)?;

        let fingerprint = Fingerprint::from_str(fingerprint).map_err(|_| invalid())?;
        let path = DerivationPath::from_str(&format!("m/{}", path)).map_err(|_| invalid())?;
        let xpriv = Zeroizing::new(xpriv.to_string());
        let mut xpriv = Xpriv::from_str(&xpriv).map_err(|_| invalid())?;

        if !is_same_network_kind(xpriv.network, network) {
            return Err(CustodyError::KeyGeneration(format!(
                "stored key is not valid on {}",
                network
            )));
        }
        xpriv.network = network;

        ExtendedKeyPair::from_parts(xpriv, fingerprint, path)
    }

    /// 唯一使用私钥签名的位置
    pub fn sign(
        &self,
        xpub: &Xpub,
        child_path: &DerivationPath,
        sighash: &Message,
    ) -> Result<ecdsa::Signature> {
        let keys = self.read();
        let pair = keys
            .get(&account_id(xpub))
            .ok_or(CustodyError::KeyNotFound)?;

        let mut child = pair.xpriv().derive_priv(&*SECP, child_path)?;
        let signature = SECP.sign_ecdsa(sighash, &child.private_key);
        child.private_key.non_secure_erase();

        Ok(signature)
    }
}

/// App 私钥签名能力
///
/// 只持有存储引用与公钥，克隆不复制私钥。
#[derive(Clone)]
pub struct AppKeyCapability {
    store: Arc<KeyMaterialStore>,
    xpub: Xpub,
}

impl AppKeyCapability {
    pub fn xpub(&self) -> &Xpub {
        &self.xpub
    }

    pub fn is_available(&self) -> bool {
        self.store.contains(&self.xpub)
    }
}

impl std::fmt::Debug for AppKeyCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppKeyCapability")
            .field("xpub", &self.xpub.to_string())
            .finish()
    }
}

impl AppKeySigner for AppKeyCapability {
    fn account_xpub(&self) -> Xpub {
        self.xpub
    }

    fn sign(&self, keychain: Keychain, index: u32, sighash: &Message) -> Result<ecdsa::Signature> {
        let path = relative_path(keychain, index)?;
        self.store.sign(&self.xpub, &path, sighash)
    }
}
