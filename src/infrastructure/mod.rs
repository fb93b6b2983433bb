pub mod cancellation;
pub mod log_redact;
pub mod logging;
pub mod wallet_lock;

pub use cancellation::SigningCancellation;
pub use wallet_lock::{WalletLockGuard, WalletLockRegistry};
