//! 描述符构建器
//!
//! 观察描述符是公钥的纯函数：相同输入得到逐字节相同的描述符文本，
//! 因此可以在任何时候重算并与服务端上报的描述符比对。

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use bitcoin::Network;

use crate::domain::descriptor::{SpendingDescriptor, WatchingDescriptor};
use crate::domain::keys::{is_same_network_kind, same_account_key, DescriptorKey};
use crate::domain::signing_factor::{DescriptorTemplate, SigningFactor};
use crate::error::{CustodyError, Result};
use crate::infrastructure::log_redact::SensitiveRedact;
use crate::service::key_material_store::AppKeyCapability;

pub struct DescriptorBuilder;

impl DescriptorBuilder {
    /// 由各因子的公钥构建观察描述符
    pub fn build_watching_descriptor(
        template: DescriptorTemplate,
        network: Network,
        factor_keys: &BTreeMap<SigningFactor, DescriptorKey>,
    ) -> Result<WatchingDescriptor> {
        Self::check_factor_set(template, factor_keys.keys().copied().collect())?;

        let mut seen = HashSet::new();
        for (factor, key) in factor_keys {
            if !is_same_network_kind(key.network(), network) {
                tracing::warn!(
                    factor = %factor,
                    key = %key.redact(),
                    network = %network,
                    "Factor key belongs to another network"
                );
                return Err(CustodyError::malformed_key(
                    *factor,
                    format!("key network {} does not match {}", key.network(), network),
                ));
            }
            if !seen.insert(key.xpub.public_key) {
                return Err(CustodyError::malformed_key(*factor, "duplicate key"));
            }
        }

        WatchingDescriptor::new(template, network, factor_keys.clone())
    }

    /// 先解析 `[fp/path]xpub` 文本，再构建观察描述符
    pub fn build_watching_descriptor_from_str(
        template: DescriptorTemplate,
        network: Network,
        factor_keys: &BTreeMap<SigningFactor, String>,
    ) -> Result<WatchingDescriptor> {
        Self::check_factor_set(template, factor_keys.keys().copied().collect())?;

        let parsed = factor_keys
            .iter()
            .map(|(factor, text)| Ok((*factor, DescriptorKey::parse(*factor, text)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Self::build_watching_descriptor(template, network, &parsed)
    }

    /// 构建支出描述符：观察描述符 + App 私钥签名能力
    ///
    /// App 公钥必须与能力句柄对应，且私钥仍在存储中。
    pub fn build_spending_descriptor(
        template: DescriptorTemplate,
        network: Network,
        factor_keys: &BTreeMap<SigningFactor, DescriptorKey>,
        app_key: AppKeyCapability,
    ) -> Result<SpendingDescriptor> {
        let watching = Self::build_watching_descriptor(template, network, factor_keys)?;

        let app_public = watching.key(SigningFactor::AppKey).ok_or_else(|| {
            CustodyError::IncompleteFactorSet {
                missing: vec![SigningFactor::AppKey],
                unexpected: Vec::new(),
            }
        })?;
        if !same_account_key(&app_public.xpub, app_key.xpub()) {
            return Err(CustodyError::malformed_key(
                SigningFactor::AppKey,
                "app key does not match key material store",
            ));
        }
        if !app_key.is_available() {
            return Err(CustodyError::KeyNotFound);
        }

        tracing::debug!(descriptor = %watching.redact(), "Built spending descriptor");

        Ok(SpendingDescriptor::new(watching, Arc::new(app_key)))
    }

    fn check_factor_set(
        template: DescriptorTemplate,
        provided: BTreeSet<SigningFactor>,
    ) -> Result<()> {
        let expected = template.factors();
        let missing: Vec<_> = expected.difference(&provided).copied().collect();
        let unexpected: Vec<_> = provided.difference(&expected).copied().collect();

        if missing.is_empty() && unexpected.is_empty() {
            return Ok(());
        }

        Err(CustodyError::IncompleteFactorSet {
            missing,
            unexpected,
        })
    }
}
