//! 扩展密钥模型
//!
//! BIP-84 账户级扩展密钥对、描述符公钥，以及网络相关的派生路径规则

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{self, All, Secp256k1};
use bitcoin::Network;
use miniscript::descriptor::{DescriptorPublicKey, DescriptorXKey, Wildcard};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::domain::signing_factor::SigningFactor;
use crate::error::{CustodyError, Result};

/// 全局 secp256k1 上下文（只读，线程安全）
pub static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// BIP-84 purpose
pub const BIP84_PURPOSE: u32 = 84;

/// 主网 coin type 为 0，其余网络为 1
pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

/// m/84'/coin'/account'
pub fn bip84_account_path(network: Network, account: u32) -> Result<DerivationPath> {
    let path = [
        ChildNumber::from_hardened_idx(BIP84_PURPOSE)?,
        ChildNumber::from_hardened_idx(coin_type(network))?,
        ChildNumber::from_hardened_idx(account)?,
    ];
    Ok(DerivationPath::from(path.to_vec()))
}

/// 扩展公钥只区分主网/测试网前缀
pub fn is_same_network_kind(a: Network, b: Network) -> bool {
    (a == Network::Bitcoin) == (b == Network::Bitcoin)
}

/// 同一账户公钥：公钥与链码一致，网络只比较主网/测试网
///
/// Regtest / Signet 的扩展密钥序列化为 `tpub`/`tprv`，解析回来是 Testnet。
pub fn same_account_key(a: &Xpub, b: &Xpub) -> bool {
    a.public_key == b.public_key
        && a.chain_code == b.chain_code
        && is_same_network_kind(a.network, b.network)
}

/// 派生链：收款 / 找零
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Keychain {
    External,
    Internal,
}

impl Keychain {
    pub fn index(&self) -> u32 {
        match self {
            Self::External => 0,
            Self::Internal => 1,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Self::External),
            1 => Some(Self::Internal),
            _ => None,
        }
    }

    pub fn child_number(&self) -> ChildNumber {
        ChildNumber::Normal {
            index: self.index(),
        }
    }
}

/// 账户级 xpub 以下的相对路径 `<keychain>/<index>`
pub fn relative_path(keychain: Keychain, index: u32) -> Result<DerivationPath> {
    let index = ChildNumber::from_normal_idx(index)
        .map_err(|e| CustodyError::invalid_transaction(format!("derivation index: {}", e)))?;
    Ok(DerivationPath::from(vec![keychain.child_number(), index]))
}

/// 去掉 `m/` 前缀的路径文本（描述符 origin 使用）
fn origin_path_str(path: &DerivationPath) -> String {
    let rendered = path.to_string();
    rendered
        .trim_start_matches('m')
        .trim_start_matches('/')
        .to_string()
}

/// 私钥包装：Drop 时擦除标量，Debug 不输出内容
pub struct SecretXpriv(Xpriv);

impl SecretXpriv {
    pub(crate) fn new(xpriv: Xpriv) -> Self {
        Self(xpriv)
    }

    pub(crate) fn expose(&self) -> &Xpriv {
        &self.0
    }
}

impl Drop for SecretXpriv {
    fn drop(&mut self) {
        self.0.private_key.non_secure_erase();
    }
}

impl fmt::Debug for SecretXpriv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretXpriv([redacted])")
    }
}

/// 扩展密钥对（账户级）
///
/// 不变量：`xpriv` 在 `origin_path` 下与 `xpub` 严格对应。
/// 不实现 Serialize / Clone，持久化需要显式调用密钥存储的导出接口。
#[derive(Debug)]
pub struct ExtendedKeyPair {
    xpub: Xpub,
    xpriv: SecretXpriv,
    master_fingerprint: Fingerprint,
    origin_path: DerivationPath,
}

impl ExtendedKeyPair {
    /// 从主密钥派生账户级密钥对
    pub(crate) fn from_master(master: &Xpriv, origin_path: DerivationPath) -> Result<Self> {
        let master_fingerprint = master.fingerprint(&*SECP);
        let account = master.derive_priv(&*SECP, &origin_path)?;
        let xpub = Xpub::from_priv(&*SECP, &account);
        Ok(Self {
            xpub,
            xpriv: SecretXpriv::new(account),
            master_fingerprint,
            origin_path,
        })
    }

    /// 从持久化层恢复（账户级 xpriv + origin）
    ///
    /// 恢复的 xpriv 必须是账户级密钥，深度需与 origin 路径一致。
    pub fn from_parts(
        account_xpriv: Xpriv,
        master_fingerprint: Fingerprint,
        origin_path: DerivationPath,
    ) -> Result<Self> {
        if account_xpriv.depth as usize != origin_path.len() {
            return Err(CustodyError::KeyGeneration(format!(
                "xpriv depth {} does not match origin path {}",
                account_xpriv.depth, origin_path
            )));
        }
        let xpub = Xpub::from_priv(&*SECP, &account_xpriv);
        Ok(Self {
            xpub,
            xpriv: SecretXpriv::new(account_xpriv),
            master_fingerprint,
            origin_path,
        })
    }

    pub fn xpub(&self) -> &Xpub {
        &self.xpub
    }

    pub fn master_fingerprint(&self) -> Fingerprint {
        self.master_fingerprint
    }

    pub fn derivation_path(&self) -> &DerivationPath {
        &self.origin_path
    }

    pub fn network(&self) -> Network {
        self.xpub.network
    }

    pub(crate) fn xpriv(&self) -> &Xpriv {
        self.xpriv.expose()
    }

    /// 校验私钥与公钥一致（往返派生）
    pub fn verify_consistency(&self) -> bool {
        let derived = Xpub::from_priv(&*SECP, self.xpriv.expose());
        derived == self.xpub
    }

    /// 用于描述符的公钥表示
    pub fn descriptor_key(&self) -> DescriptorKey {
        DescriptorKey {
            xpub: self.xpub,
            master_fingerprint: self.master_fingerprint,
            origin_path: self.origin_path.clone(),
        }
    }
}

/// 描述符中的账户级公钥：`[fingerprint/origin]xpub`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    pub xpub: Xpub,
    pub master_fingerprint: Fingerprint,
    pub origin_path: DerivationPath,
}

impl DescriptorKey {
    /// 解析 `[d34db33f/84'/0'/0']xpub...`
    ///
    /// 任何编码或曲线校验失败都返回 `MalformedKey`。
    pub fn parse(factor: SigningFactor, s: &str) -> Result<Self> {
        let s = s.trim();
        let (origin, key) = match s.strip_prefix('[') {
            Some(rest) => rest
                .split_once(']')
                .ok_or_else(|| CustodyError::malformed_key(factor, "unterminated key origin"))?,
            None => return Err(CustodyError::malformed_key(factor, "missing key origin")),
        };

        let (fingerprint, path) = origin.split_once('/').unwrap_or((origin, ""));
        let master_fingerprint = Fingerprint::from_str(fingerprint)
            .map_err(|e| CustodyError::malformed_key(factor, format!("fingerprint: {}", e)))?;
        let origin_path = DerivationPath::from_str(&format!("m/{}", path).trim_end_matches('/'))
            .map_err(|e| CustodyError::malformed_key(factor, format!("origin path: {}", e)))?;
        let xpub = Xpub::from_str(key)
            .map_err(|e| CustodyError::malformed_key(factor, format!("xpub: {}", e)))?;

        if xpub.depth as usize != origin_path.len() {
            return Err(CustodyError::malformed_key(
                factor,
                "xpub depth does not match origin path",
            ));
        }

        Ok(Self {
            xpub,
            master_fingerprint,
            origin_path,
        })
    }

    pub fn network(&self) -> Network {
        self.xpub.network
    }

    /// 派生 `<keychain>/<index>` 子公钥
    pub fn derive_child(&self, keychain: Keychain, index: u32) -> Result<secp256k1::PublicKey> {
        let path = relative_path(keychain, index)?;
        let child = self
            .xpub
            .derive_pub(&*SECP, &path)
            .map_err(|e| CustodyError::invalid_transaction(format!("derive child: {}", e)))?;
        Ok(child.public_key)
    }

    /// 从主密钥起的完整路径（写入 PSBT bip32_derivation）
    pub fn full_path(&self, keychain: Keychain, index: u32) -> Result<DerivationPath> {
        Ok(self.origin_path.extend(relative_path(keychain, index)?))
    }

    /// miniscript 描述符公钥 `[origin]xpub/<keychain>/*`
    pub fn to_descriptor_public_key(&self, keychain: Keychain) -> DescriptorPublicKey {
        DescriptorPublicKey::XPub(DescriptorXKey {
            origin: Some((self.master_fingerprint, self.origin_path.clone())),
            xkey: self.xpub,
            derivation_path: DerivationPath::from(vec![keychain.child_number()]),
            wildcard: Wildcard::Unhardened,
        })
    }
}

impl fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = origin_path_str(&self.origin_path);
        if path.is_empty() {
            write!(f, "[{}]{}", self.master_fingerprint, self.xpub)
        } else {
            write!(f, "[{}/{}]{}", self.master_fingerprint, path, self.xpub)
        }
    }
}
