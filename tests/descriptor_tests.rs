//! 描述符构造与密钥材料集成测试

mod common;

use std::collections::BTreeMap;

use bitcoin::secp256k1::Message;
use custody_core::domain::{DescriptorTemplate, Keychain, SigningFactor, WatchingDescriptorRecord};
use custody_core::service::{DescriptorBuilder, KeyMaterialStore};
use custody_core::CustodyError;

use common::{TestWallet, NETWORK};

#[test]
fn test_watching_descriptor_is_deterministic() {
    let wallet = TestWallet::standard();
    let keys = wallet.factor_keys(DescriptorTemplate::AppHardwareServer);

    let first =
        DescriptorBuilder::build_watching_descriptor(DescriptorTemplate::AppHardwareServer, NETWORK, &keys)
            .unwrap();
    let second =
        DescriptorBuilder::build_watching_descriptor(DescriptorTemplate::AppHardwareServer, NETWORK, &keys)
            .unwrap();

    assert_eq!(first.receive_descriptor(), second.receive_descriptor());
    assert_eq!(first.change_descriptor(), second.change_descriptor());
    assert_eq!(first.wallet_id(), second.wallet_id());
    assert_eq!(
        first.address(Keychain::External, 7).unwrap(),
        second.address(Keychain::External, 7).unwrap()
    );
}

#[test]
fn test_descriptor_from_strings_matches_typed_keys() {
    let wallet = TestWallet::standard();
    let keys = wallet.factor_keys(DescriptorTemplate::AppHardware);
    let strings: BTreeMap<_, _> = keys.iter().map(|(f, k)| (*f, k.to_string())).collect();

    let typed =
        DescriptorBuilder::build_watching_descriptor(DescriptorTemplate::AppHardware, NETWORK, &keys)
            .unwrap();
    let parsed = DescriptorBuilder::build_watching_descriptor_from_str(
        DescriptorTemplate::AppHardware,
        NETWORK,
        &strings,
    )
    .unwrap();

    assert_eq!(typed.receive_descriptor(), parsed.receive_descriptor());
}

#[test]
fn test_server_descriptor_comparison() {
    let wallet = TestWallet::standard();
    let ours = wallet.watching(DescriptorTemplate::AppHardwareServer);
    let other = TestWallet::new(9, common::FakeHardwareDevice::new(2), common::FakeServerCosigner::new(3))
        .watching(DescriptorTemplate::AppHardwareServer);

    assert!(ours.matches_server_descriptor(&ours.receive_descriptor()));
    assert!(!ours.matches_server_descriptor(&other.receive_descriptor()));
    assert!(!ours.matches_server_descriptor(""));
}

#[test]
fn test_server_record_rebuilds_same_descriptor() {
    let wallet = TestWallet::standard();
    let ours = wallet.watching(DescriptorTemplate::AppHardwareServer);

    // 上报给服务端的 JSON 记录
    let payload = serde_json::to_value(ours.to_record()).unwrap();
    assert_eq!(payload["wallet_id"], ours.wallet_id().as_str());
    assert_eq!(payload["template"], "app_hardware_server");
    assert_eq!(payload["receive"], ours.receive_descriptor());
    assert_eq!(payload["change"], ours.change_descriptor());
    assert_eq!(payload["keys"].as_object().unwrap().len(), 3);

    // 服务端回传记录后可以独立重建并比对
    let record: WatchingDescriptorRecord = serde_json::from_value(payload).unwrap();
    let rebuilt =
        DescriptorBuilder::build_watching_descriptor_from_str(record.template, record.network, &record.keys)
            .unwrap();
    assert_eq!(rebuilt.wallet_id(), record.wallet_id);
    assert!(rebuilt.matches_server_descriptor(&record.receive));
    assert_eq!(rebuilt.change_descriptor(), record.change);
}

#[test]
fn test_receive_and_change_chains_differ() {
    let descriptor = TestWallet::standard().watching(DescriptorTemplate::AppServer);
    assert_ne!(
        descriptor.address(Keychain::External, 0).unwrap(),
        descriptor.address(Keychain::Internal, 0).unwrap()
    );
    assert_ne!(
        descriptor.address(Keychain::External, 0).unwrap(),
        descriptor.address(Keychain::External, 1).unwrap()
    );
}

#[test]
fn test_missing_factor_is_rejected() {
    let wallet = TestWallet::standard();
    let mut keys = wallet.factor_keys(DescriptorTemplate::AppHardwareServer);
    keys.remove(&SigningFactor::ServerKey);

    let err = DescriptorBuilder::build_watching_descriptor(
        DescriptorTemplate::AppHardwareServer,
        NETWORK,
        &keys,
    )
    .unwrap_err();
    assert_eq!(
        err,
        CustodyError::IncompleteFactorSet {
            missing: vec![SigningFactor::ServerKey],
            unexpected: vec![],
        }
    );
}

#[test]
fn test_spending_descriptor_shares_wallet_id() {
    let wallet = TestWallet::standard();
    let watching = wallet.watching(DescriptorTemplate::AppHardware);
    let spending = wallet.spending(DescriptorTemplate::AppHardware);

    assert_eq!(spending.wallet_id(), watching.wallet_id());
    // Debug 输出不得泄露私钥
    let debug = format!("{:?}", spending);
    assert!(!debug.contains("prv"));
}

#[test]
fn test_key_pair_round_trip() {
    let store = KeyMaterialStore::new();
    let (pair, mnemonic) = KeyMaterialStore::generate_with_mnemonic(NETWORK).unwrap();
    let xpub = *pair.xpub();
    assert!(pair.verify_consistency());

    let restored = KeyMaterialStore::restore_from_mnemonic(&mnemonic, NETWORK).unwrap();
    assert_eq!(restored.xpub(), &xpub);
    assert_eq!(restored.master_fingerprint(), pair.master_fingerprint());

    store.import(pair).unwrap();
    let exported = store.export_for_storage(&xpub).unwrap();
    let reloaded = KeyMaterialStore::restore_from_storage(&exported, NETWORK).unwrap();
    assert_eq!(reloaded.xpub(), &xpub);
    assert_eq!(reloaded.derivation_path(), restored.derivation_path());
}

#[test]
fn test_removed_key_capability_is_unavailable() {
    let wallet = TestWallet::standard();
    assert!(wallet.app.is_available());

    let msg = Message::from_digest([7u8; 32]);
    let child = wallet.app_key.derive_child(Keychain::External, 0).unwrap();
    let path = custody_core::domain::keys::relative_path(Keychain::External, 0).unwrap();
    let sig = wallet.store.sign(wallet.app.xpub(), &path, &msg).unwrap();
    bitcoin::secp256k1::Secp256k1::verification_only()
        .verify_ecdsa(&msg, &sig, &child)
        .unwrap();

    assert!(wallet.store.remove(wallet.app.xpub()));
    assert!(!wallet.app.is_available());
    assert_eq!(
        wallet.store.sign(wallet.app.xpub(), &path, &msg).unwrap_err(),
        CustodyError::KeyNotFound
    );
}
