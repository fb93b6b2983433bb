//! 配置管理模块
//! 支持从环境变量和配置文件加载配置

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use bitcoin::Network;
use serde::{Deserialize, Serialize};

/// 托管核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_network")]
    pub network: Network,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    #[serde(default)]
    pub ansi: bool,
}

/// 硬件（NFC）通道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// 等待用户在设备上操作的超时
    pub user_timeout_secs: u64,
    /// 瞬时错误（断连/超时）的最大重试次数
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

/// 签名流程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// 排队等待钱包锁的最长时间
    pub lock_timeout_secs: u64,
}

/// 恢复清扫配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub fee_rate_sat_vb: u64,
    pub dust_limit_sat: u64,
}

fn default_network() -> Network {
    std::env::var("CUSTODY_NETWORK")
        .ok()
        .and_then(|s| Network::from_str(&s).ok())
        .unwrap_or(Network::Testnet)
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
            ansi: std::env::var("LOG_ANSI")
                .ok()
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            user_timeout_secs: std::env::var("HW_USER_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
            max_retries: std::env::var("HW_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            retry_backoff_ms: std::env::var("HW_RETRY_BACKOFF_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(250),
        }
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: std::env::var("SIGNING_LOCK_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            fee_rate_sat_vb: std::env::var("SWEEP_FEE_RATE_SAT_VB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            dust_limit_sat: std::env::var("SWEEP_DUST_LIMIT_SAT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(546),
        }
    }
}

impl HardwareConfig {
    pub fn user_timeout(&self) -> Duration {
        Duration::from_secs(self.user_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl SigningConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            network: default_network(),
            logging: LoggingConfig::default(),
            hardware: HardwareConfig::default(),
            signing: SigningConfig::default(),
            sweep: SweepConfig::default(),
        })
    }

    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高）
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = Self::from_env()?;

        if let Some(path) = path {
            if path.as_ref().exists() {
                config = Self::from_file(path)?;
            }
        }

        Ok(config)
    }

    /// 读取 .env 后按环境变量 + 可选配置文件加载并校验
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let path = std::env::var("CUSTODY_CONFIG").ok();
        let config = Self::from_env_and_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        // 验证日志级别
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        // 验证日志格式
        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("LOG_FORMAT must be 'json' or 'text'");
        }

        if self.hardware.user_timeout_secs == 0 {
            anyhow::bail!("HW_USER_TIMEOUT_SECS must be greater than 0");
        }

        if self.hardware.max_retries > 10 {
            anyhow::bail!("HW_MAX_RETRIES must not exceed 10");
        }

        if self.signing.lock_timeout_secs == 0 {
            anyhow::bail!("SIGNING_LOCK_TIMEOUT_SECS must be greater than 0");
        }

        if self.sweep.fee_rate_sat_vb == 0 {
            anyhow::bail!("SWEEP_FEE_RATE_SAT_VB must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_config_from_env() {
        let config = Config::from_env().unwrap();
        assert!(config.hardware.user_timeout_secs > 0);
        assert!(config.sweep.dust_limit_sat > 0);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
network = "signet"

[logging]
level = "debug"
format = "json"

[hardware]
user_timeout_secs = 30
max_retries = 3
retry_backoff_ms = 100

[signing]
lock_timeout_secs = 120

[sweep]
fee_rate_sat_vb = 12
dust_limit_sat = 600
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network, Network::Signet);
        assert_eq!(config.hardware.max_retries, 3);
        assert_eq!(config.hardware.user_timeout(), Duration::from_secs(30));
        assert_eq!(config.sweep.fee_rate_sat_vb, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[logging]
level = "info"
format = "text"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.logging.format, "text");
        assert!(config.signing.lock_timeout_secs > 0);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::from_env().unwrap();
        config.logging.level = "info".into();
        config.logging.format = "text".into();
        assert!(config.validate().is_ok());

        config.logging.format = "xml".into();
        assert!(config.validate().is_err());

        config.logging.format = "json".into();
        config.hardware.user_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
