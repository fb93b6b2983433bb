//! 签名因子协调器
//!
//! 决定本次需要哪些因子联签，按顺序收集部分签名，最后按描述符脚本组装见证。
//! 部分失败的状态只存在于 `SigningAttempt` 中；失败时部分签名被全部丢弃，
//! 重试前必须 `reset()`。
//!
//! 状态流转：
//! ```text
//! Collecting ──hw 回调──▶ HardwarePending ──成功──▶ Collecting
//!     │                        │
//!     │                        └─超时/断连/取消/拒绝─▶ Failed
//!     └─所有因子就绪─▶ Ready ──组装──▶ Finalized
//!                        └──签名不匹配──▶ Failed
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{ecdsa, Message, PublicKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{ScriptBuf, Transaction, Txid, Witness};

use crate::config::{Config, SigningConfig};
use crate::domain::descriptor::{AppKeySigner, SpendingDescriptor, WalletId, WatchingDescriptor};
use crate::domain::keys::{same_account_key, Keychain, SECP};
use crate::domain::signature::{HardwareSighash, PartialSignature, SighashItem, SigningPayload};
use crate::domain::signing_factor::{SigningFactor, SigningPath};
use crate::domain::signing_state::{FailureReason, SigningState};
use crate::domain::sweep::{Sweep, SweepStatus};
use crate::error::{CustodyError, Result};
use crate::infrastructure::cancellation::SigningCancellation;
use crate::infrastructure::log_redact::SensitiveRedact;
use crate::infrastructure::wallet_lock::WalletLockRegistry;
use crate::service::hardware_channel::HardwareChannel;
use crate::service::sweep_generator::{SweepGenerator, SweepUtxo};

/// 服务端联签协作方（网络客户端由外部实现）
///
/// 只会收到观察描述符可推导的信息：PSBT 与摘要列表，不会收到任何私钥。
#[async_trait]
pub trait ServerCosigner: Send + Sync {
    /// 按 `items` 顺序返回服务端签名
    async fn cosign(
        &self,
        wallet_id: &WalletId,
        psbt: &Psbt,
        items: &[SighashItem],
    ) -> Result<Vec<ecdsa::Signature>>;
}

/// 组装完成、可广播的交易
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedTransaction {
    pub transaction: Transaction,
    pub txid: Txid,
}

impl FinalizedTransaction {
    /// 原始交易十六进制
    pub fn to_hex(&self) -> String {
        bitcoin::consensus::encode::serialize_hex(&self.transaction)
    }
}

/// 单个输入的签名上下文
#[derive(Debug, Clone)]
struct InputContext {
    keychain: Keychain,
    index: u32,
    sighash: Message,
    witness_script: ScriptBuf,
    /// 规范顺序（派生公钥字典序）
    canonical_keys: Vec<(SigningFactor, PublicKey)>,
}

impl InputContext {
    fn expected_key(&self, factor: SigningFactor) -> Option<PublicKey> {
        self.canonical_keys
            .iter()
            .find(|(f, _)| *f == factor)
            .map(|(_, key)| *key)
    }
}

/// 单次签名尝试
#[derive(Debug)]
pub struct SigningAttempt {
    descriptor: WatchingDescriptor,
    wallet_id: WalletId,
    path: SigningPath,
    psbt: Psbt,
    inputs: Vec<InputContext>,
    partials: BTreeMap<(usize, SigningFactor), ecdsa::Signature>,
    state: SigningState,
}

impl SigningAttempt {
    /// 校验 PSBT 属于该描述符并计算每个输入的 BIP-143 摘要
    pub fn new(descriptor: &WatchingDescriptor, psbt: Psbt, path: SigningPath) -> Result<Self> {
        if !descriptor.template().allows(path) {
            return Err(CustodyError::invalid_transaction(format!(
                "signing path {:?} is not allowed by template {:?}",
                path,
                descriptor.template()
            )));
        }
        if psbt.inputs.is_empty() {
            return Err(CustodyError::invalid_transaction("transaction has no inputs"));
        }

        let inputs = Self::input_contexts(descriptor, &psbt)?;

        let wallet_id = descriptor.wallet_id();
        tracing::debug!(
            wallet_id = %wallet_id,
            path = ?path,
            inputs = inputs.len(),
            "Signing attempt created"
        );

        Ok(Self {
            descriptor: descriptor.clone(),
            wallet_id,
            path,
            psbt,
            inputs,
            partials: BTreeMap::new(),
            state: SigningState::Collecting,
        })
    }

    /// 逐输入定位派生位置并计算 BIP-143 摘要
    fn input_contexts(descriptor: &WatchingDescriptor, psbt: &Psbt) -> Result<Vec<InputContext>> {
        let mut inputs = Vec::with_capacity(psbt.inputs.len());
        let mut cache = SighashCache::new(&psbt.unsigned_tx);

        for (i, input) in psbt.inputs.iter().enumerate() {
            let utxo = input.witness_utxo.as_ref().ok_or_else(|| {
                CustodyError::invalid_transaction(format!("input {} has no witness_utxo", i))
            })?;
            let (keychain, index) = descriptor.locate_input(input)?;

            if utxo.script_pubkey != descriptor.script_pubkey(keychain, index)? {
                return Err(CustodyError::invalid_transaction(format!(
                    "input {} script does not match descriptor",
                    i
                )));
            }

            let witness_script = descriptor.witness_script(keychain, index)?;
            if let Some(declared) = &input.witness_script {
                if declared != &witness_script {
                    return Err(CustodyError::invalid_transaction(format!(
                        "input {} witness script does not match descriptor",
                        i
                    )));
                }
            }

            let sighash = cache
                .segwit_signature_hash(i, &witness_script, utxo.value, EcdsaSighashType::All)
                .map_err(|e| {
                    CustodyError::invalid_transaction(format!("sighash for input {}: {}", i, e))
                })?;

            inputs.push(InputContext {
                keychain,
                index,
                sighash: Message::from_digest(sighash.to_byte_array()),
                witness_script,
                canonical_keys: descriptor.canonical_keys(keychain, index)?,
            });
        }

        Ok(inputs)
    }

    pub fn state(&self) -> SigningState {
        self.state
    }

    pub fn wallet_id(&self) -> &WalletId {
        &self.wallet_id
    }

    pub fn path(&self) -> SigningPath {
        self.path
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// 已收集的部分签名数量
    pub fn partial_count(&self) -> usize {
        self.partials.len()
    }

    /// 某因子是否已为所有输入提供签名
    pub fn has_factor(&self, factor: SigningFactor) -> bool {
        (0..self.inputs.len()).all(|i| self.partials.contains_key(&(i, factor)))
    }

    fn is_complete(&self) -> bool {
        self.path.factors().into_iter().all(|f| self.has_factor(f))
    }

    /// 逐输入待签摘要
    pub fn sighash_items(&self) -> Vec<SighashItem> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(i, ctx)| SighashItem {
                input_index: i,
                keychain: ctx.keychain,
                derivation_index: ctx.index,
                sighash: ctx.sighash,
            })
            .collect()
    }

    /// 附带当前部分签名的 PSBT
    pub fn psbt(&self) -> Psbt {
        let mut psbt = self.psbt.clone();
        for ((i, factor), sig) in &self.partials {
            if let Some(key) = self.inputs[*i].expected_key(*factor) {
                psbt.inputs[*i].partial_sigs.insert(
                    bitcoin::PublicKey::new(key),
                    bitcoin::ecdsa::Signature::sighash_all(*sig),
                );
            }
        }
        psbt
    }

    fn require_factor(&self, factor: SigningFactor) -> Result<()> {
        if self.path.requires(factor) {
            return Ok(());
        }
        Err(CustodyError::IncompleteFactorSet {
            missing: Vec::new(),
            unexpected: vec![factor],
        })
    }

    fn require_state(&self, expected: SigningState, to: &str) -> Result<()> {
        if self.state == expected {
            return Ok(());
        }
        Err(CustodyError::InvalidStateTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        })
    }

    /// 合并一个部分签名
    ///
    /// 签名与期望公钥不符时尝试立即失败（`SignatureMismatch`，不会自动重试）。
    pub fn add_partial(&mut self, partial: PartialSignature) -> Result<()> {
        self.require_state(SigningState::Collecting, "collecting")?;
        self.require_factor(partial.factor)?;
        let partial = partial.normalized();

        let ctx = self.inputs.get(partial.input_index).ok_or_else(|| {
            CustodyError::invalid_transaction(format!(
                "input index {} out of range",
                partial.input_index
            ))
        })?;
        let expected = ctx.expected_key(partial.factor).ok_or_else(|| {
            CustodyError::malformed_key(partial.factor, "factor has no key in descriptor")
        })?;

        if !partial.verify(&ctx.sighash, &expected) {
            return Err(self.fail(CustodyError::SignatureMismatch {
                factor: partial.factor,
                input_index: partial.input_index,
            }));
        }

        self.partials
            .insert((partial.input_index, partial.factor), partial.signature);

        if self.is_complete() {
            self.state.transition(SigningState::Ready)?;
            tracing::info!(
                wallet_id = %self.wallet_id,
                path = ?self.path,
                "All required partial signatures collected"
            );
        }
        Ok(())
    }

    /// 按输入顺序合并某因子的一组签名
    pub fn add_factor_signatures(
        &mut self,
        factor: SigningFactor,
        signatures: Vec<ecdsa::Signature>,
    ) -> Result<()> {
        if signatures.len() != self.inputs.len() {
            let err = match factor {
                SigningFactor::ServerKey => CustodyError::ServerCosign(format!(
                    "expected {} signatures, got {}",
                    self.inputs.len(),
                    signatures.len()
                )),
                _ => CustodyError::invalid_transaction(format!(
                    "{} returned {} signatures for {} inputs",
                    factor,
                    signatures.len(),
                    self.inputs.len()
                )),
            };
            return Err(self.fail(err));
        }

        for (input_index, signature) in signatures.into_iter().enumerate() {
            self.add_partial(PartialSignature {
                factor,
                input_index,
                signature,
            })?;
        }
        Ok(())
    }

    /// App 因子本地签名
    pub fn sign_with_app(&mut self, signer: &dyn AppKeySigner) -> Result<()> {
        self.require_factor(SigningFactor::AppKey)?;
        let app_key = self.descriptor.key(SigningFactor::AppKey).ok_or_else(|| {
            CustodyError::malformed_key(SigningFactor::AppKey, "descriptor has no app key")
        })?;
        if !same_account_key(&signer.account_xpub(), &app_key.xpub) {
            return Err(CustodyError::malformed_key(
                SigningFactor::AppKey,
                "signer does not match descriptor app key",
            ));
        }

        let signatures = self
            .inputs
            .iter()
            .map(|ctx| signer.sign(ctx.keychain, ctx.index, &ctx.sighash))
            .collect::<Result<Vec<_>>>();

        match signatures {
            Ok(signatures) => self.add_factor_signatures(SigningFactor::AppKey, signatures),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// 进入 HardwarePending，返回交给硬件的载荷
    pub fn begin_hardware(&mut self) -> Result<SigningPayload> {
        self.require_factor(SigningFactor::Hardware)?;
        let key = self.descriptor.key(SigningFactor::Hardware).ok_or_else(|| {
            CustodyError::malformed_key(SigningFactor::Hardware, "descriptor has no hardware key")
        })?;

        let items = self
            .inputs
            .iter()
            .enumerate()
            .map(|(i, ctx)| {
                Ok(HardwareSighash {
                    input_index: i,
                    path: key.full_path(ctx.keychain, ctx.index)?,
                    sighash: ctx.sighash,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let payload = SigningPayload {
            wallet_id: self.wallet_id.clone(),
            psbt: self.psbt(),
            master_fingerprint: key.master_fingerprint,
            items,
        };

        self.state.transition(SigningState::HardwarePending)?;
        Ok(payload)
    }

    /// 硬件回调结果：成功则回到 Collecting 并合并签名，失败则进入 Failed
    pub fn complete_hardware(&mut self, result: Result<Vec<ecdsa::Signature>>) -> Result<()> {
        self.require_state(SigningState::HardwarePending, "collecting")?;

        match result {
            Ok(signatures) => {
                self.state.transition(SigningState::Collecting)?;
                self.add_factor_signatures(SigningFactor::Hardware, signatures)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// 进入 Failed 并丢弃全部部分签名
    pub(crate) fn fail(&mut self, err: CustodyError) -> CustodyError {
        let reason = FailureReason::from_error(&err);
        let discarded = self.partials.len();
        self.partials.clear();

        if !self.state.is_terminal() {
            self.state = SigningState::Failed(reason);
        }

        match &err {
            CustodyError::SignatureMismatch {
                factor,
                input_index,
            } => {
                tracing::error!(
                    integrity_alert = true,
                    wallet_id = %self.wallet_id,
                    factor = %factor,
                    input_index = *input_index,
                    "Partial signature does not validate against its expected key"
                );
            }
            _ => {
                tracing::warn!(
                    wallet_id = %self.wallet_id,
                    reason = %reason,
                    discarded_signatures = discarded,
                    error = %err,
                    "Signing attempt failed"
                );
            }
        }
        err
    }

    /// 丢弃所有部分签名并回到 Collecting（重试前调用）
    pub fn reset(&mut self) -> Result<()> {
        if self.state == SigningState::Finalized {
            return Err(CustodyError::InvalidStateTransition {
                from: self.state.to_string(),
                to: SigningState::Collecting.to_string(),
            });
        }

        let discarded = self.partials.len();
        self.partials.clear();
        self.state = SigningState::Collecting;
        tracing::info!(
            wallet_id = %self.wallet_id,
            discarded_signatures = discarded,
            "Signing attempt reset"
        );
        Ok(())
    }

    /// 按规范公钥顺序组装见证并完成交易
    pub fn finalize(&mut self) -> Result<FinalizedTransaction> {
        self.require_state(SigningState::Ready, "finalized")?;

        match self.assemble() {
            Ok(transaction) => {
                self.state.transition(SigningState::Finalized)?;
                let txid = transaction.txid();
                tracing::info!(
                    wallet_id = %self.wallet_id,
                    txid = %txid,
                    path = ?self.path,
                    "Transaction finalized"
                );
                Ok(FinalizedTransaction { transaction, txid })
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn assemble(&self) -> Result<Transaction> {
        let mut tx = self.psbt.unsigned_tx.clone();

        for (i, ctx) in self.inputs.iter().enumerate() {
            // CHECKMULTISIG 的额外出栈元素
            let mut stack: Vec<Vec<u8>> = vec![Vec::new()];

            for (factor, key) in &ctx.canonical_keys {
                if !self.path.requires(*factor) {
                    continue;
                }
                let sig = self.partials.get(&(i, *factor)).ok_or_else(|| {
                    CustodyError::invalid_transaction(format!(
                        "missing {} signature for input {}",
                        factor, i
                    ))
                })?;
                if SECP.verify_ecdsa(&ctx.sighash, sig, key).is_err() {
                    return Err(CustodyError::SignatureMismatch {
                        factor: *factor,
                        input_index: i,
                    });
                }
                stack.push(bitcoin::ecdsa::Signature::sighash_all(*sig).to_vec());
            }

            stack.push(ctx.witness_script.to_bytes());
            tx.input[i].witness = Witness::from_slice(&stack);
        }

        Ok(tx)
    }
}

/// 每个因子一种签名策略
pub enum FactorSigner<'a> {
    AppKey(&'a dyn AppKeySigner),
    Hardware {
        channel: &'a HardwareChannel,
        cancel: &'a SigningCancellation,
    },
    ServerKey(&'a dyn ServerCosigner),
}

impl<'a> FactorSigner<'a> {
    pub fn factor(&self) -> SigningFactor {
        match self {
            Self::AppKey(_) => SigningFactor::AppKey,
            Self::Hardware { .. } => SigningFactor::Hardware,
            Self::ServerKey(_) => SigningFactor::ServerKey,
        }
    }

    /// 为尝试收集本因子的部分签名
    pub async fn collect(&self, attempt: &mut SigningAttempt) -> Result<()> {
        match self {
            Self::AppKey(signer) => attempt.sign_with_app(*signer),
            Self::Hardware { channel, cancel } => {
                let payload = attempt.begin_hardware()?;
                let result = channel.sign_transaction(payload, cancel).await;
                attempt.complete_hardware(result)
            }
            Self::ServerKey(cosigner) => {
                let wallet_id = attempt.wallet_id().clone();
                let psbt = attempt.psbt();
                let items = attempt.sighash_items();
                match cosigner.cosign(&wallet_id, &psbt, &items).await {
                    Ok(signatures) => {
                        attempt.add_factor_signatures(SigningFactor::ServerKey, signatures)
                    }
                    Err(e) => Err(attempt.fail(e)),
                }
            }
        }
    }
}

/// 签名因子协调器
///
/// 同一钱包的签名请求通过钱包锁串行化；私钥能力由调用方显式传入。
pub struct SigningFactorCoordinator {
    locks: WalletLockRegistry,
    hardware: Option<HardwareChannel>,
    server: Option<Arc<dyn ServerCosigner>>,
    signing: SigningConfig,
    sweeps: SweepGenerator,
}

impl SigningFactorCoordinator {
    pub fn new(config: &Config) -> Self {
        Self {
            locks: WalletLockRegistry::new(),
            hardware: None,
            server: None,
            signing: config.signing.clone(),
            sweeps: SweepGenerator::new(config.sweep.clone()),
        }
    }

    pub fn with_hardware(mut self, channel: HardwareChannel) -> Self {
        self.hardware = Some(channel);
        self
    }

    pub fn with_server(mut self, cosigner: Arc<dyn ServerCosigner>) -> Self {
        self.server = Some(cosigner);
        self
    }

    pub fn hardware(&self) -> Option<&HardwareChannel> {
        self.hardware.as_ref()
    }

    /// 使用支出描述符（App 私钥能力）签名
    pub async fn sign_transaction(
        &self,
        descriptor: &SpendingDescriptor,
        psbt: Psbt,
        path: SigningPath,
        cancel: &SigningCancellation,
    ) -> Result<FinalizedTransaction> {
        tracing::debug!(descriptor = %descriptor.redact(), path = ?path, "Signing transaction");
        self.run_attempt(
            descriptor.watching(),
            Some(descriptor.app_signer().as_ref()),
            psbt,
            path,
            cancel,
        )
        .await
    }

    async fn run_attempt(
        &self,
        descriptor: &WatchingDescriptor,
        app_key: Option<&dyn AppKeySigner>,
        psbt: Psbt,
        path: SigningPath,
        cancel: &SigningCancellation,
    ) -> Result<FinalizedTransaction> {
        let wallet_id = descriptor.wallet_id();
        let _guard = self
            .locks
            .acquire(&wallet_id, self.signing.lock_timeout())
            .await?;

        let mut attempt = SigningAttempt::new(descriptor, psbt, path)?;

        for factor in path.factors() {
            let signer = self.signer_for(factor, app_key, cancel)?;
            if factor.is_physical() {
                tracing::info!(wallet_id = %wallet_id, factor = %factor, "Waiting for user on signing device");
            }
            signer.collect(&mut attempt).await?;
        }

        attempt.finalize()
    }

    fn signer_for<'a>(
        &'a self,
        factor: SigningFactor,
        app_key: Option<&'a dyn AppKeySigner>,
        cancel: &'a SigningCancellation,
    ) -> Result<FactorSigner<'a>> {
        match factor {
            SigningFactor::AppKey => app_key
                .map(|signer| FactorSigner::AppKey(signer))
                .ok_or(CustodyError::KeyNotFound),
            SigningFactor::Hardware => self
                .hardware
                .as_ref()
                .map(|channel| FactorSigner::Hardware { channel, cancel })
                .ok_or_else(|| CustodyError::Config("hardware channel not configured".into())),
            SigningFactor::ServerKey => self
                .server
                .as_deref()
                .map(|cosigner| FactorSigner::ServerKey(cosigner))
                .ok_or_else(|| CustodyError::Config("server cosigner not configured".into())),
        }
    }

    /// 丢失因子后的资金清扫：没有可清扫的资金时返回 `None`
    pub fn prepare_sweep(
        &self,
        source: &WatchingDescriptor,
        destination: &WatchingDescriptor,
        utxos: &[SweepUtxo],
        path: SigningPath,
    ) -> Result<Option<Sweep>> {
        self.sweeps.generate(source, destination, utxos, path)
    }

    /// 签名清扫交易
    ///
    /// 恢复路径不含 App 时（丢失手机）`app_key` 传 `None`。
    pub async fn sign_sweep(
        &self,
        source: &WatchingDescriptor,
        app_key: Option<&dyn AppKeySigner>,
        sweep: &Sweep,
        cancel: &SigningCancellation,
    ) -> Result<FinalizedTransaction> {
        if sweep.status != SweepStatus::Pending {
            return Err(CustodyError::InvalidStateTransition {
                from: sweep.status.as_str().to_string(),
                to: "signed".to_string(),
            });
        }
        if source.wallet_id() != sweep.source_wallet {
            return Err(CustodyError::invalid_transaction(
                "sweep does not belong to this wallet",
            ));
        }

        tracing::info!(
            sweep_id = %sweep.id,
            source_wallet = %sweep.source_wallet,
            destination_wallet = %sweep.destination_wallet,
            path = ?sweep.path,
            "Signing recovery sweep"
        );

        self.run_attempt(source, app_key, sweep.psbt.clone(), sweep.path, cancel)
            .await
    }
}
