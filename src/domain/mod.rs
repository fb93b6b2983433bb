//! Domain 模块
//!
//! 纯数据与规则，不做 I/O

pub mod descriptor;
pub mod keys;
pub mod proof_of_possession;
pub mod signature;
pub mod signing_factor;
pub mod signing_state;
pub mod sweep;

// 重新导出常用类型
pub use descriptor::{
    AppKeySigner, SpendingDescriptor, WalletId, WatchingDescriptor, WatchingDescriptorRecord,
};
pub use keys::{DescriptorKey, ExtendedKeyPair, Keychain};
pub use proof_of_possession::HwFactorProofOfPossession;
pub use signature::{HardwareSighash, PartialSignature, SighashItem, SigningPayload};
pub use signing_factor::{DescriptorTemplate, SigningFactor, SigningPath};
pub use signing_state::{FailureReason, SigningState};
pub use sweep::{Sweep, SweepStatus};
