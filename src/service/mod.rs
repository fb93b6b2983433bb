//! 服务层：有行为的组件

pub mod descriptor_builder;
pub mod hardware_channel;
pub mod interceptors;
pub mod key_material_store;
pub mod proof_of_possession;
pub mod signing_coordinator;
pub mod sweep_generator;

pub use descriptor_builder::DescriptorBuilder;
pub use hardware_channel::{
    HardwareChannel, HardwareChannelBuilder, HardwareCommand, HardwareInterceptor,
    HardwareResponse, NfcCommands, Next,
};
pub use interceptors::{LoggingInterceptor, RetryInterceptor, SessionInterceptor, TimeoutInterceptor};
pub use key_material_store::{AppKeyCapability, KeyMaterialStore};
pub use proof_of_possession::{ProofOfPossessionIssuer, ProofOfPossessionVerifier};
pub use signing_coordinator::{
    FactorSigner, FinalizedTransaction, ServerCosigner, SigningAttempt, SigningFactorCoordinator,
};
pub use sweep_generator::{SweepGenerator, SweepUtxo};
