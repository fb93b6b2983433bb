//! 签名因子模型
//!
//! App / 硬件 / 服务端 三方因子，以及描述符模板和签名路径

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 签名因子（封闭枚举，可作为 map key）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningFactor {
    AppKey,
    Hardware,
    ServerKey,
}

impl SigningFactor {
    pub const ALL: [SigningFactor; 3] = [Self::AppKey, Self::Hardware, Self::ServerKey];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppKey => "app",
            Self::Hardware => "hardware",
            Self::ServerKey => "server",
        }
    }

    /// 是否为物理因子（需要用户在设备上操作）
    pub fn is_physical(&self) -> bool {
        matches!(self, Self::Hardware)
    }
}

impl fmt::Display for SigningFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 描述符模板：决定钱包需要哪些因子的公钥
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorTemplate {
    /// 2-of-2：App + 硬件
    AppHardware,
    /// 2-of-2：App + 服务端（服务端协助恢复路径）
    AppServer,
    /// 2-of-3：App + 硬件 + 服务端，任意两方可签
    AppHardwareServer,
}

impl DescriptorTemplate {
    pub fn factors(&self) -> BTreeSet<SigningFactor> {
        match self {
            Self::AppHardware => [SigningFactor::AppKey, SigningFactor::Hardware].into(),
            Self::AppServer => [SigningFactor::AppKey, SigningFactor::ServerKey].into(),
            Self::AppHardwareServer => SigningFactor::ALL.into(),
        }
    }

    /// 签名门限
    pub fn threshold(&self) -> usize {
        2
    }

    /// 该模板下是否允许某签名路径
    pub fn allows(&self, path: SigningPath) -> bool {
        let factors = self.factors();
        let required = path.factors();
        required.len() == self.threshold() && required.is_subset(&factors)
    }
}

/// 签名路径：本次联签的因子组合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningPath {
    /// 日常支出
    AppHardware,
    /// 丢失硬件后的恢复
    AppServer,
    /// 丢失手机后的恢复
    HardwareServer,
}

impl SigningPath {
    pub fn factors(&self) -> BTreeSet<SigningFactor> {
        match self {
            Self::AppHardware => [SigningFactor::AppKey, SigningFactor::Hardware].into(),
            Self::AppServer => [SigningFactor::AppKey, SigningFactor::ServerKey].into(),
            Self::HardwareServer => [SigningFactor::Hardware, SigningFactor::ServerKey].into(),
        }
    }

    pub fn requires(&self, factor: SigningFactor) -> bool {
        self.factors().contains(&factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_factors() {
        assert_eq!(DescriptorTemplate::AppHardware.factors().len(), 2);
        assert_eq!(DescriptorTemplate::AppHardwareServer.factors().len(), 3);
        assert!(DescriptorTemplate::AppServer
            .factors()
            .contains(&SigningFactor::ServerKey));
    }

    #[test]
    fn test_template_allows_path() {
        assert!(DescriptorTemplate::AppHardware.allows(SigningPath::AppHardware));
        assert!(!DescriptorTemplate::AppHardware.allows(SigningPath::AppServer));
        assert!(DescriptorTemplate::AppServer.allows(SigningPath::AppServer));
        assert!(DescriptorTemplate::AppHardwareServer.allows(SigningPath::HardwareServer));
        assert!(DescriptorTemplate::AppHardwareServer.allows(SigningPath::AppServer));
    }

    #[test]
    fn test_factor_order_is_stable() {
        let mut factors = vec![
            SigningFactor::ServerKey,
            SigningFactor::AppKey,
            SigningFactor::Hardware,
        ];
        factors.sort();
        assert_eq!(factors, SigningFactor::ALL.to_vec());
    }
}
