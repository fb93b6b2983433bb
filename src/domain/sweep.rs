//! 恢复资金的清扫交易
//!
//! 丢失某一因子后，把旧描述符下的资金转入新描述符。
//! 没有需要清扫的资金时不会创建 Sweep（调用方拿到 `None`）。

use bitcoin::psbt::Psbt;
use bitcoin::{Amount, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::descriptor::WalletId;
use crate::domain::signing_factor::SigningPath;
use crate::error::CustodyError;

/// 清扫交易状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Pending,
    Broadcast,
    Confirmed,
    Abandoned,
}

impl SweepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Broadcast => "broadcast",
            Self::Confirmed => "confirmed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn can_transition(from: SweepStatus, to: SweepStatus) -> bool {
        use SweepStatus::*;

        matches!(
            (from, to),
            (Pending, Broadcast)
                | (Broadcast, Confirmed)
                | (Pending, Abandoned)
                | (Broadcast, Abandoned)
        )
    }

    /// 已结束：确认或放弃后可销毁
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Abandoned)
    }
}

/// 待签/待广播的清扫交易
#[derive(Debug, Clone)]
pub struct Sweep {
    pub id: Uuid,
    pub source_wallet: WalletId,
    pub destination_wallet: WalletId,
    pub path: SigningPath,
    pub psbt: Psbt,
    pub total_input: Amount,
    pub fee: Amount,
    pub status: SweepStatus,
    pub txid: Option<Txid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sweep {
    pub(crate) fn new(
        source_wallet: WalletId,
        destination_wallet: WalletId,
        path: SigningPath,
        psbt: Psbt,
        total_input: Amount,
        fee: Amount,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_wallet,
            destination_wallet,
            path,
            psbt,
            total_input,
            fee,
            status: SweepStatus::Pending,
            txid: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 到账金额
    pub fn amount(&self) -> Amount {
        self.total_input.checked_sub(self.fee).unwrap_or(Amount::ZERO)
    }

    fn transition(&mut self, to: SweepStatus) -> Result<(), CustodyError> {
        if !SweepStatus::can_transition(self.status, to) {
            return Err(CustodyError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        tracing::info!(
            sweep_id = %self.id,
            from = self.status.as_str(),
            to = to.as_str(),
            "Sweep status changed"
        );
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_broadcast(&mut self, txid: Txid) -> Result<(), CustodyError> {
        self.transition(SweepStatus::Broadcast)?;
        self.txid = Some(txid);
        Ok(())
    }

    pub fn mark_confirmed(&mut self) -> Result<(), CustodyError> {
        self.transition(SweepStatus::Confirmed)
    }

    pub fn abandon(&mut self) -> Result<(), CustodyError> {
        self.transition(SweepStatus::Abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_status_transitions() {
        assert!(SweepStatus::can_transition(
            SweepStatus::Pending,
            SweepStatus::Broadcast
        ));
        assert!(SweepStatus::can_transition(
            SweepStatus::Broadcast,
            SweepStatus::Confirmed
        ));
        assert!(!SweepStatus::can_transition(
            SweepStatus::Pending,
            SweepStatus::Confirmed
        ));
        assert!(!SweepStatus::can_transition(
            SweepStatus::Confirmed,
            SweepStatus::Abandoned
        ));
        assert!(SweepStatus::Abandoned.is_settled());
        assert!(!SweepStatus::Broadcast.is_settled());
    }
}
