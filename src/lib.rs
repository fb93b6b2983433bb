//! custody-core - 多因子支出密钥托管与交易授权协调器
//!
//! 自托管比特币钱包的核心：每个签名因子（App / 硬件 / 服务端）的扩展密钥、
//! 基于这些公钥的描述符、因子联签流程、硬件（NFC）交易拦截器链，以及硬件持有证明校验。
//!
//! 私钥只存在于 `KeyMaterialStore` 中；其余组件最多持有签名能力句柄。

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod service;

// 重新导出常用类型
pub use config::Config;
pub use error::{CustodyError, HardwareFailureReason, Result};

// 统一模块导出
pub mod prelude {
    pub use crate::{
        config::Config,
        domain::{
            DescriptorKey, DescriptorTemplate, ExtendedKeyPair, HwFactorProofOfPossession,
            Keychain, PartialSignature, SigningFactor, SigningPath, SigningPayload, SigningState,
            SpendingDescriptor, Sweep, SweepStatus, WalletId, WatchingDescriptor,
        },
        error::{CustodyError, HardwareFailureReason},
        infrastructure::SigningCancellation,
        service::{
            AppKeyCapability, DescriptorBuilder, FinalizedTransaction, HardwareChannel,
            KeyMaterialStore, NfcCommands, ProofOfPossessionIssuer, ProofOfPossessionVerifier,
            ServerCosigner, SigningAttempt, SigningFactorCoordinator,
        },
    };
}
