use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, FixedBytes, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;

use x402::signature::{signing_hash, transfer_domain};
use x402::{
    Authorization, Eip712Verifier, FacilitatorConfig, FeePolicy, InvalidReason, Ledger,
    PaymentRequirements, SignatureParts, SimLedger, VerificationEngine,
};

const NETWORK: &str = "base-sepolia";

fn treasury() -> Address {
    Address::new([0xee; 20])
}

fn setup() -> (Arc<FacilitatorConfig>, Arc<SimLedger>, VerificationEngine) {
    let config = Arc::new(FacilitatorConfig::new(
        FeePolicy::new(100, treasury()).unwrap(),
    ));
    let ledger = Arc::new(SimLedger::new());
    let mut ledgers: HashMap<String, Arc<dyn Ledger>> = HashMap::new();
    ledgers.insert(NETWORK.to_string(), Arc::clone(&ledger) as Arc<dyn Ledger>);
    let engine = VerificationEngine::new(Arc::clone(&config), ledgers, Arc::new(Eip712Verifier));
    (config, ledger, engine)
}

fn usdc(config: &FacilitatorConfig) -> Address {
    config.network(NETWORK).unwrap().assets[0].address
}

fn requirements(config: &FacilitatorConfig, pay_to: Address) -> PaymentRequirements {
    PaymentRequirements {
        scheme: "exact".to_string(),
        network: NETWORK.to_string(),
        max_amount_required: "1000000".to_string(),
        resource: "https://api.example.com/data".to_string(),
        description: None,
        mime_type: None,
        pay_to: format!("{pay_to}"),
        max_timeout_seconds: Some(300),
        asset: format!("{}", usdc(config)),
        extra: None,
    }
}

/// Build and sign an authorization under the test network's USDC domain.
fn signed_auth(
    config: &FacilitatorConfig,
    signer: &PrivateKeySigner,
    to: Address,
    value: u64,
    valid_after: u64,
    valid_before: u64,
) -> Authorization {
    let network = config.network(NETWORK).unwrap();
    let domain = transfer_domain(network, &network.assets[0]);
    let mut auth = Authorization {
        from: signer.address(),
        to,
        value: U256::from(value),
        valid_after,
        valid_before,
        nonce: FixedBytes::new(rand_nonce(signer)),
        signature: None,
    };
    let hash = signing_hash(&auth, &domain);
    let sig = signer.sign_hash_sync(&hash).unwrap();
    auth.signature = Some(SignatureParts::from_compact(&sig.as_bytes()).unwrap());
    auth
}

// Distinct per-signer nonce without pulling in a rand dependency.
fn rand_nonce(signer: &PrivateKeySigner) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[..20].copy_from_slice(signer.address().as_slice());
    bytes
}

#[tokio::test]
async fn valid_authorization_is_accepted() {
    let (config, ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);

    ledger.credit(usdc(&config), signer.address(), U256::from(1_000_000u64));
    let auth = signed_auth(&config, &signer, payee, 1_000_000, 0, u64::MAX);
    let reqs = requirements(&config, payee);

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert!(result.is_valid);
    assert_eq!(result.invalid_reason, None);
    assert_eq!(result.payer, Some(signer.address()));
}

#[tokio::test]
async fn verify_is_idempotent_for_an_unchanged_ledger() {
    let (config, ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);

    ledger.credit(usdc(&config), signer.address(), U256::from(1_000_000u64));
    let auth = signed_auth(&config, &signer, payee, 1_000_000, 0, u64::MAX);
    let reqs = requirements(&config, payee);

    let first = engine.verify(&reqs, &auth).await.unwrap();
    let second = engine.verify(&reqs, &auth).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn expired_authorization_is_rejected() {
    let (config, _ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);

    let auth = signed_auth(&config, &signer, payee, 1_000_000, 0, 1_000);
    let reqs = requirements(&config, payee);

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert!(!result.is_valid);
    assert_eq!(result.invalid_reason, Some(InvalidReason::Expired));
}

#[tokio::test]
async fn not_yet_valid_authorization_is_rejected() {
    let (config, _ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);

    let auth = signed_auth(&config, &signer, payee, 1_000_000, u64::MAX - 1, u64::MAX);
    let reqs = requirements(&config, payee);

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert_eq!(result.invalid_reason, Some(InvalidReason::NotYetValid));
}

#[tokio::test]
async fn consumed_nonce_is_rejected_as_replay() {
    let (config, ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);

    ledger.credit(usdc(&config), signer.address(), U256::from(1_000_000u64));
    let auth = signed_auth(&config, &signer, payee, 1_000_000, 0, u64::MAX);
    ledger.consume_nonce(signer.address(), auth.nonce);
    let reqs = requirements(&config, payee);

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert_eq!(result.invalid_reason, Some(InvalidReason::NonceReused));
}

#[tokio::test]
async fn insufficient_balance_reports_observed_balance() {
    let (config, ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);

    ledger.credit(usdc(&config), signer.address(), U256::from(250u64));
    let auth = signed_auth(&config, &signer, payee, 1_000_000, 0, u64::MAX);
    let reqs = requirements(&config, payee);

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert_eq!(
        result.invalid_reason,
        Some(InvalidReason::InsufficientBalance)
    );
    assert_eq!(result.balance.as_deref(), Some("250"));
    assert_eq!(result.decimals, Some(6));
}

#[tokio::test]
async fn amount_above_maximum_is_rejected() {
    let (config, ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);

    ledger.credit(usdc(&config), signer.address(), U256::from(5_000_000u64));
    let auth = signed_auth(&config, &signer, payee, 2_000_000, 0, u64::MAX);
    let reqs = requirements(&config, payee);

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert_eq!(
        result.invalid_reason,
        Some(InvalidReason::AmountExceedsMaximum)
    );
}

#[tokio::test]
async fn recipient_mismatch_is_rejected() {
    let (config, ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);
    let other = Address::new([0xcc; 20]);

    ledger.credit(usdc(&config), signer.address(), U256::from(1_000_000u64));
    let auth = signed_auth(&config, &signer, other, 1_000_000, 0, u64::MAX);
    let reqs = requirements(&config, payee);

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert_eq!(result.invalid_reason, Some(InvalidReason::RecipientMismatch));
}

#[tokio::test]
async fn recipient_comparison_ignores_address_case() {
    let (config, ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);

    ledger.credit(usdc(&config), signer.address(), U256::from(1_000_000u64));
    let auth = signed_auth(&config, &signer, payee, 1_000_000, 0, u64::MAX);
    let mut reqs = requirements(&config, payee);
    reqs.pay_to = reqs.pay_to.to_uppercase().replace("0X", "0x");

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert!(result.is_valid);
}

#[tokio::test]
async fn tampered_value_invalidates_signature() {
    let (config, ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);

    ledger.credit(usdc(&config), signer.address(), U256::from(1_000_000u64));
    let mut auth = signed_auth(&config, &signer, payee, 500_000, 0, u64::MAX);
    auth.value = U256::from(900_000u64);
    let reqs = requirements(&config, payee);

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert_eq!(result.invalid_reason, Some(InvalidReason::InvalidSignature));
}

#[tokio::test]
async fn missing_signature_is_invalid() {
    let (config, ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);

    ledger.credit(usdc(&config), signer.address(), U256::from(1_000_000u64));
    let mut auth = signed_auth(&config, &signer, payee, 1_000_000, 0, u64::MAX);
    auth.signature = None;
    let reqs = requirements(&config, payee);

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert_eq!(result.invalid_reason, Some(InvalidReason::InvalidSignature));
}

#[tokio::test]
async fn unknown_network_is_rejected_first() {
    let (config, _ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);

    let auth = signed_auth(&config, &signer, payee, 1_000_000, 0, u64::MAX);
    let mut reqs = requirements(&config, payee);
    reqs.network = "polygon-mainnet".to_string();

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert_eq!(
        result.invalid_reason,
        Some(InvalidReason::UnsupportedNetwork)
    );
}

#[tokio::test]
async fn unknown_asset_is_rejected() {
    let (config, _ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);

    let auth = signed_auth(&config, &signer, payee, 1_000_000, 0, u64::MAX);
    let mut reqs = requirements(&config, payee);
    reqs.asset = format!("{}", Address::new([0x01; 20]));

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert_eq!(result.invalid_reason, Some(InvalidReason::UnsupportedAsset));
}

#[tokio::test]
async fn checks_short_circuit_in_order() {
    let (config, _ledger, engine) = setup();
    let signer = PrivateKeySigner::random();
    let payee = Address::new([0xbb; 20]);
    let other = Address::new([0xcc; 20]);

    // Expired AND wrong recipient AND zero balance: the time window check
    // runs before balance and recipient, so Expired wins.
    let auth = signed_auth(&config, &signer, other, 1_000_000, 0, 1_000);
    let reqs = requirements(&config, payee);

    let result = engine.verify(&reqs, &auth).await.unwrap();
    assert_eq!(result.invalid_reason, Some(InvalidReason::Expired));
}
