//! 恢复清扫交易构造
//!
//! 把旧描述符下的全部 UTXO 合并转入新描述符的一个地址。
//! 手续费按权重估算：
//! - 交易固定开销 42 WU（10.5 vB）
//! - 每个 P2WSH 输出 172 WU（43 vB）
//! - 每个 2-of-2 P2WSH 输入约 384 WU，2-of-3 约 420 WU

use bitcoin::absolute::LockTime;
use bitcoin::psbt::Psbt;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::config::SweepConfig;
use crate::domain::descriptor::WatchingDescriptor;
use crate::domain::keys::Keychain;
use crate::domain::signing_factor::SigningPath;
use crate::domain::sweep::Sweep;
use crate::error::{CustodyError, Result};

const TX_OVERHEAD_WU: u64 = 42;
const P2WSH_OUTPUT_WU: u64 = 172;
const MULTISIG_2OF2_INPUT_WU: u64 = 384;
const MULTISIG_2OF3_INPUT_WU: u64 = 420;

/// 待清扫的 UTXO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepUtxo {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    pub keychain: Keychain,
    pub index: u32,
}

pub struct SweepGenerator {
    config: SweepConfig,
}

impl SweepGenerator {
    pub fn new(config: SweepConfig) -> Self {
        Self { config }
    }

    fn input_weight(source: &WatchingDescriptor) -> u64 {
        match source.keys().len() {
            2 => MULTISIG_2OF2_INPUT_WU,
            _ => MULTISIG_2OF3_INPUT_WU,
        }
    }

    /// 估算手续费
    pub fn estimate_fee(&self, source: &WatchingDescriptor, input_count: usize) -> Amount {
        let weight = TX_OVERHEAD_WU
            + P2WSH_OUTPUT_WU
            + Self::input_weight(source) * input_count as u64;
        let vbytes = (weight + 3) / 4;
        Amount::from_sat(vbytes * self.config.fee_rate_sat_vb)
    }

    /// 构造清扫交易；无资金或扣费后低于粉尘线时返回 `None`
    pub fn generate(
        &self,
        source: &WatchingDescriptor,
        destination: &WatchingDescriptor,
        utxos: &[SweepUtxo],
        path: SigningPath,
    ) -> Result<Option<Sweep>> {
        if !source.template().allows(path) {
            return Err(CustodyError::invalid_transaction(format!(
                "signing path {:?} is not allowed by template {:?}",
                path,
                source.template()
            )));
        }
        if source.wallet_id() == destination.wallet_id() {
            return Err(CustodyError::invalid_transaction(
                "sweep destination must differ from source",
            ));
        }
        if source.network() != destination.network() {
            return Err(CustodyError::invalid_transaction(
                "sweep destination is on a different network",
            ));
        }

        if utxos.is_empty() {
            tracing::debug!(wallet_id = %source.wallet_id(), "Nothing to sweep");
            return Ok(None);
        }

        let total_input = utxos
            .iter()
            .try_fold(Amount::ZERO, |acc, utxo| acc.checked_add(utxo.txout.value))
            .ok_or_else(|| CustodyError::invalid_transaction("input amount overflow"))?;
        let fee = self.estimate_fee(source, utxos.len());
        let dust = Amount::from_sat(self.config.dust_limit_sat);

        let amount = match total_input.checked_sub(fee) {
            Some(amount) if amount >= dust => amount,
            _ => {
                tracing::info!(
                    wallet_id = %source.wallet_id(),
                    total_input_sat = total_input.to_sat(),
                    fee_sat = fee.to_sat(),
                    "Sweep amount below dust limit, skipping"
                );
                return Ok(None);
            }
        };

        // 找零链 index 0 作为接收地址，避免与用户展示的收款地址混淆
        let destination_script: ScriptBuf = destination.script_pubkey(Keychain::Internal, 0)?;

        let unsigned_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: utxos
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![TxOut {
                value: amount,
                script_pubkey: destination_script,
            }],
        };

        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx)
            .map_err(|e| CustodyError::invalid_transaction(format!("psbt: {}", e)))?;

        for (input, utxo) in psbt.inputs.iter_mut().zip(utxos) {
            input.witness_utxo = Some(utxo.txout.clone());
            source.update_psbt_input(input, utxo.keychain, utxo.index)?;
        }

        let sweep = Sweep::new(
            source.wallet_id(),
            destination.wallet_id(),
            path,
            psbt,
            total_input,
            fee,
        );

        tracing::info!(
            sweep_id = %sweep.id,
            source_wallet = %sweep.source_wallet,
            destination_wallet = %sweep.destination_wallet,
            inputs = utxos.len(),
            amount_sat = amount.to_sat(),
            fee_sat = fee.to_sat(),
            "Sweep prepared"
        );

        Ok(Some(sweep))
    }
}
