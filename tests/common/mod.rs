//! 测试辅助模块
//! 提供假硬件设备、假服务端联签方和钱包夹具

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{ecdsa, Message, PublicKey, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use custody_core::config::{Config, HardwareConfig, LoggingConfig, SigningConfig, SweepConfig};
use custody_core::domain::{
    DescriptorKey, DescriptorTemplate, Keychain, SighashItem, SigningFactor, SigningPayload,
    SpendingDescriptor, WalletId, WatchingDescriptor,
};
use custody_core::error::{CustodyError, HardwareFailureReason, Result};
use custody_core::service::{
    AppKeyCapability, DescriptorBuilder, KeyMaterialStore, NfcCommands, ServerCosigner,
};

pub const NETWORK: Network = Network::Regtest;

/// 测试配置（不读环境变量）
pub fn test_config() -> Config {
    Config {
        network: NETWORK,
        logging: LoggingConfig {
            level: "debug".into(),
            format: "text".into(),
            ansi: false,
        },
        hardware: HardwareConfig {
            user_timeout_secs: 5,
            max_retries: 2,
            retry_backoff_ms: 1,
        },
        signing: SigningConfig {
            lock_timeout_secs: 10,
        },
        sweep: SweepConfig {
            fee_rate_sat_vb: 10,
            dust_limit_sat: 546,
        },
    }
}

/// 只存放一把密钥的独立存储（模拟设备内的安全元件 / 服务端 HSM）
pub struct RemoteKey {
    store: Arc<KeyMaterialStore>,
    pub key: DescriptorKey,
}

impl RemoteKey {
    pub fn new(seed: u8) -> Self {
        let store = KeyMaterialStore::new();
        let pair = KeyMaterialStore::generate_from_entropy(&[seed; 16], NETWORK).unwrap();
        let key = pair.descriptor_key();
        store.import(pair).unwrap();
        Self { store, key }
    }

    pub fn xpub(&self) -> &Xpub {
        &self.key.xpub
    }

    /// 账户级公钥（持有证明使用）
    pub fn identity_key(&self) -> PublicKey {
        self.key.xpub.public_key
    }

    pub fn sign_relative(&self, path: &DerivationPath, msg: &Message) -> Result<ecdsa::Signature> {
        self.store.sign(&self.key.xpub, path, msg)
    }

    pub fn sign_child(&self, keychain: Keychain, index: u32, msg: &Message) -> Result<ecdsa::Signature> {
        let path = DerivationPath::from(vec![
            ChildNumber::from_normal_idx(keychain.index()).unwrap(),
            ChildNumber::from_normal_idx(index).unwrap(),
        ]);
        self.sign_relative(&path, msg)
    }
}

/// 假 NFC 设备
pub struct FakeHardwareDevice {
    key: RemoteKey,
    /// 用另一把密钥签名（模拟被篡改的设备）
    impostor: Option<RemoteKey>,
    failures: Mutex<VecDeque<HardwareFailureReason>>,
    delay: Duration,
    /// 返回未规范化（高 S）的签名
    high_s: bool,
    pub sessions_begun: AtomicUsize,
    pub sessions_ended: AtomicUsize,
    pub sign_calls: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    open_sessions: AtomicUsize,
    pub max_open_sessions: AtomicUsize,
}

impl FakeHardwareDevice {
    pub fn new(seed: u8) -> Self {
        Self {
            key: RemoteKey::new(seed),
            impostor: None,
            failures: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            high_s: false,
            sessions_begun: AtomicUsize::new(0),
            sessions_ended: AtomicUsize::new(0),
            sign_calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            open_sessions: AtomicUsize::new(0),
            max_open_sessions: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_high_s(mut self) -> Self {
        self.high_s = true;
        self
    }

    pub fn with_impostor(mut self, seed: u8) -> Self {
        self.impostor = Some(RemoteKey::new(seed));
        self
    }

    pub fn fail_next(&self, reason: HardwareFailureReason) {
        self.failures.lock().unwrap().push_back(reason);
    }

    pub fn descriptor_key(&self) -> DescriptorKey {
        self.key.key.clone()
    }

    pub fn identity_key(&self) -> PublicKey {
        self.key.identity_key()
    }

    fn signer(&self) -> &RemoteKey {
        self.impostor.as_ref().unwrap_or(&self.key)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn shape(&self, sig: ecdsa::Signature) -> ecdsa::Signature {
        if self.high_s {
            to_high_s(sig)
        } else {
            sig
        }
    }

    fn take_failure(&self) -> Result<()> {
        match self.failures.lock().unwrap().pop_front() {
            Some(reason) => Err(CustodyError::hardware(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NfcCommands for FakeHardwareDevice {
    async fn begin_session(&self) -> Result<()> {
        self.sessions_begun.fetch_add(1, Ordering::SeqCst);
        let open = self.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_sessions.fetch_max(open, Ordering::SeqCst);
        Ok(())
    }

    async fn end_session(&self) {
        self.sessions_ended.fetch_add(1, Ordering::SeqCst);
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    async fn sign(&self, payload: &SigningPayload) -> Result<Vec<ecdsa::Signature>> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        self.enter();

        tokio::time::sleep(self.delay).await;
        let result = self.take_failure().and_then(|_| {
            payload
                .items
                .iter()
                .map(|item| {
                    let children: &[ChildNumber] = item.path.as_ref();
                    let relative = DerivationPath::from(&children[children.len() - 2..]);
                    self.signer()
                        .sign_relative(&relative, &item.sighash)
                        .map(|sig| self.shape(sig))
                })
                .collect()
        });

        self.leave();
        result
    }

    async fn sign_challenge(&self, digest: &[u8]) -> Result<ecdsa::Signature> {
        self.enter();
        tokio::time::sleep(self.delay).await;
        let result = self.take_failure().and_then(|_| {
            let msg = Message::from_digest_slice(digest)
                .map_err(|_| CustodyError::hardware(HardwareFailureReason::FirmwareRejected))?;
            self.signer().sign_relative(&DerivationPath::master(), &msg)
        });
        self.leave();
        result
    }
}

/// 把签名改写为高 S 形式（s' = n - s），对同一消息仍然有效
pub fn to_high_s(sig: ecdsa::Signature) -> ecdsa::Signature {
    let mut compact = sig.serialize_compact();
    let negated = SecretKey::from_slice(&compact[32..]).unwrap().negate();
    compact[32..].copy_from_slice(&negated.secret_bytes());
    ecdsa::Signature::from_compact(&compact).unwrap()
}

/// 假服务端联签方
pub struct FakeServerCosigner {
    key: RemoteKey,
    pub calls: AtomicUsize,
    pub reject: bool,
}

impl FakeServerCosigner {
    pub fn new(seed: u8) -> Self {
        Self {
            key: RemoteKey::new(seed),
            calls: AtomicUsize::new(0),
            reject: false,
        }
    }

    pub fn rejecting(seed: u8) -> Self {
        Self {
            reject: true,
            ..Self::new(seed)
        }
    }

    pub fn descriptor_key(&self) -> DescriptorKey {
        self.key.key.clone()
    }
}

#[async_trait]
impl ServerCosigner for FakeServerCosigner {
    async fn cosign(
        &self,
        _wallet_id: &WalletId,
        _psbt: &Psbt,
        items: &[SighashItem],
    ) -> Result<Vec<ecdsa::Signature>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            return Err(CustodyError::ServerCosign("policy rejected".into()));
        }
        items
            .iter()
            .map(|item| {
                self.key
                    .sign_child(item.keychain, item.derivation_index, &item.sighash)
            })
            .collect()
    }
}

/// 三方因子齐全的测试钱包
pub struct TestWallet {
    pub store: Arc<KeyMaterialStore>,
    pub app: AppKeyCapability,
    pub app_key: DescriptorKey,
    pub hardware: Arc<FakeHardwareDevice>,
    pub server: Arc<FakeServerCosigner>,
}

impl TestWallet {
    pub fn new(app_seed: u8, hardware: FakeHardwareDevice, server: FakeServerCosigner) -> Self {
        let store = KeyMaterialStore::new();
        let pair = KeyMaterialStore::generate_from_entropy(&[app_seed; 16], NETWORK).unwrap();
        let app_key = pair.descriptor_key();
        let app = store.import(pair).unwrap();

        Self {
            store,
            app,
            app_key,
            hardware: Arc::new(hardware),
            server: Arc::new(server),
        }
    }

    pub fn standard() -> Self {
        Self::new(1, FakeHardwareDevice::new(2), FakeServerCosigner::new(3))
    }

    pub fn factor_keys(&self, template: DescriptorTemplate) -> BTreeMap<SigningFactor, DescriptorKey> {
        template
            .factors()
            .into_iter()
            .map(|factor| {
                let key = match factor {
                    SigningFactor::AppKey => self.app_key.clone(),
                    SigningFactor::Hardware => self.hardware.descriptor_key(),
                    SigningFactor::ServerKey => self.server.descriptor_key(),
                };
                (factor, key)
            })
            .collect()
    }

    pub fn watching(&self, template: DescriptorTemplate) -> WatchingDescriptor {
        DescriptorBuilder::build_watching_descriptor(template, NETWORK, &self.factor_keys(template))
            .unwrap()
    }

    pub fn spending(&self, template: DescriptorTemplate) -> SpendingDescriptor {
        DescriptorBuilder::build_spending_descriptor(
            template,
            NETWORK,
            &self.factor_keys(template),
            self.app.clone(),
        )
        .unwrap()
    }
}

pub fn fake_txid(byte: u8) -> Txid {
    Txid::from_str(&hex::encode([byte; 32])).unwrap()
}

/// 构造花费描述符下若干 UTXO 的 PSBT（输出到描述符找零地址）
pub fn spend_psbt(descriptor: &WatchingDescriptor, coins: &[(Keychain, u32, u64)]) -> Psbt {
    let total: u64 = coins.iter().map(|(_, _, sat)| sat).sum();

    let unsigned_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: coins
            .iter()
            .enumerate()
            .map(|(i, _)| TxIn {
                previous_output: OutPoint {
                    txid: fake_txid(i as u8 + 1),
                    vout: i as u32,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: vec![TxOut {
            value: Amount::from_sat(total - 2_000),
            script_pubkey: descriptor.script_pubkey(Keychain::Internal, 99).unwrap(),
        }],
    };

    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx).unwrap();
    for (input, (keychain, index, sat)) in psbt.inputs.iter_mut().zip(coins) {
        input.witness_utxo = Some(TxOut {
            value: Amount::from_sat(*sat),
            script_pubkey: descriptor.script_pubkey(*keychain, *index).unwrap(),
        });
        descriptor.update_psbt_input(input, *keychain, *index).unwrap();
    }
    psbt
}

/// 校验见证：`[<empty>, sig.., witness_script]`，签名按规范公钥顺序排列
pub fn assert_witness_in_canonical_order(
    transaction: &Transaction,
    psbt: &Psbt,
    descriptor: &WatchingDescriptor,
    coins: &[(Keychain, u32, u64)],
    signers: &[SigningFactor],
) {
    use bitcoin::hashes::Hash;
    use bitcoin::sighash::{EcdsaSighashType, SighashCache};

    let secp = bitcoin::secp256k1::Secp256k1::verification_only();
    let mut cache = SighashCache::new(&psbt.unsigned_tx);

    for (i, (keychain, index, sat)) in coins.iter().enumerate() {
        let witness: Vec<Vec<u8>> = transaction.input[i].witness.to_vec();
        let script = descriptor.witness_script(*keychain, *index).unwrap();

        assert_eq!(witness.len(), signers.len() + 2);
        assert!(witness[0].is_empty());
        assert_eq!(witness.last().unwrap(), &script.to_bytes());

        let sighash = cache
            .segwit_signature_hash(i, &script, Amount::from_sat(*sat), EcdsaSighashType::All)
            .unwrap();
        let msg = Message::from_digest(sighash.to_byte_array());

        let expected: Vec<PublicKey> = descriptor
            .canonical_keys(*keychain, *index)
            .unwrap()
            .into_iter()
            .filter(|(factor, _)| signers.contains(factor))
            .map(|(_, key)| key)
            .collect();

        for (slot, key) in expected.iter().enumerate() {
            let raw = &witness[slot + 1];
            assert_eq!(*raw.last().unwrap(), 0x01, "SIGHASH_ALL byte");
            let sig = ecdsa::Signature::from_der(&raw[..raw.len() - 1]).unwrap();
            secp.verify_ecdsa(&msg, &sig, key).unwrap();
        }
    }
}
