use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{test, web, App};
use alloy::primitives::{Address, FixedBytes, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use base64::Engine;

use x402::signature::{signing_hash, transfer_domain};
use x402::{
    Authorization, Eip712Verifier, FacilitatorConfig, FeePolicy, FinalityReconciler,
    IdempotencyGuard, Ledger, MemoryStore, RateLimiter, SettlementExecutor, SignatureParts,
    SimLedger, Store, VerificationEngine,
};
use x402_facilitator::routes;
use x402_facilitator::state::AppState;

const NETWORK: &str = "base-sepolia";

fn treasury() -> Address {
    Address::new([0xee; 20])
}

fn payee() -> Address {
    Address::new([0xbb; 20])
}

/// AppState over a sim ledger, with a handle to that ledger for seeding.
fn make_state(rate_limit_rpm: u64) -> (web::Data<AppState>, Arc<SimLedger>) {
    let mut config = FacilitatorConfig::new(FeePolicy::new(100, treasury()).unwrap());
    config.rate_limit_rpm = rate_limit_rpm;
    let config = Arc::new(config);

    let ledger = Arc::new(SimLedger::new());
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mut ledgers: HashMap<String, Arc<dyn Ledger>> = HashMap::new();
    ledgers.insert(NETWORK.to_string(), Arc::clone(&ledger) as Arc<dyn Ledger>);

    let state = AppState {
        engine: VerificationEngine::new(
            Arc::clone(&config),
            ledgers.clone(),
            Arc::new(Eip712Verifier),
        ),
        executor: SettlementExecutor::new(
            Arc::clone(&config),
            ledgers.clone(),
            Arc::clone(&store),
        ),
        reconciler: Arc::new(FinalityReconciler::new(
            Arc::clone(&config),
            ledgers.clone(),
            Arc::clone(&store),
        )),
        idempotency: IdempotencyGuard::new(Some(store)),
        rate_limiter: RateLimiter::new(config.rate_limit_rpm),
        ledgers,
        metrics_token: None,
        config,
    };
    (web::Data::new(state), ledger)
}

fn usdc(config: &FacilitatorConfig) -> Address {
    config.network(NETWORK).unwrap().assets[0].address
}

fn requirements_json(config: &FacilitatorConfig) -> serde_json::Value {
    serde_json::json!({
        "scheme": "exact",
        "network": NETWORK,
        "maxAmountRequired": "1000000",
        "resource": "https://api.example.com/data",
        "payTo": format!("{}", payee()),
        "maxTimeoutSeconds": 300,
        "asset": format!("{}", usdc(config)),
    })
}

/// Sign an exact-shape payment header and base64-encode it.
fn signed_header(
    config: &FacilitatorConfig,
    signer: &PrivateKeySigner,
    value: u64,
    valid_before: u64,
    nonce_byte: u8,
) -> String {
    let network = config.network(NETWORK).unwrap();
    let domain = transfer_domain(network, &network.assets[0]);
    let mut auth = Authorization {
        from: signer.address(),
        to: payee(),
        value: U256::from(value),
        valid_after: 0,
        valid_before,
        nonce: FixedBytes::new([nonce_byte; 32]),
        signature: None,
    };
    let hash = signing_hash(&auth, &domain);
    let sig = signer.sign_hash_sync(&hash).unwrap();
    auth.signature = Some(SignatureParts::from_compact(&sig.as_bytes()).unwrap());

    let header = serde_json::json!({
        "from": format!("{}", auth.from),
        "to": format!("{}", auth.to),
        "value": auth.value.to_string(),
        "validAfter": auth.valid_after,
        "validBefore": auth.valid_before,
        "nonce": format!("0x{}", alloy::hex::encode(auth.nonce)),
        "signature": format!("0x{}", alloy::hex::encode(sig.as_bytes())),
    });
    base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&header).unwrap())
}

fn payment_body(config: &FacilitatorConfig, header: String) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "x402Version": 1,
        "paymentHeader": header,
        "paymentRequirements": requirements_json(config),
    }))
    .unwrap()
}

#[actix_rt::test]
async fn supported_lists_scheme_network_kinds() {
    let (state, _ledger) = make_state(120);
    let app = test::init_service(App::new().app_data(state).service(routes::supported)).await;

    let req = test::TestRequest::get().uri("/supported").to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    let kinds = body["kinds"].as_array().unwrap();
    assert_eq!(kinds.len(), 4);
    assert!(kinds
        .iter()
        .any(|k| k["scheme"] == "exact" && k["network"] == "base-sepolia"));
}

#[actix_rt::test]
async fn fee_breakdown_reports_base_and_human_units() {
    let (state, _ledger) = make_state(120);
    let app = test::init_service(App::new().app_data(state).service(routes::fee_quote)).await;

    let req = test::TestRequest::get()
        .uri("/fee-breakdown?amount=1000000")
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["amount"]["base"], "1000000");
    assert_eq!(body["amount"]["human"], "1");
    assert_eq!(body["fee"]["base"], "10000");
    assert_eq!(body["net"]["base"], "990000");
    assert_eq!(body["fee"]["bps"], 100);
}

#[actix_rt::test]
async fn fee_breakdown_rejects_non_integer_amounts() {
    let (state, _ledger) = make_state(120);
    let app = test::init_service(App::new().app_data(state).service(routes::fee_quote)).await;

    let req = test::TestRequest::get()
        .uri("/fee-breakdown?amount=1.5")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn verify_accepts_a_funded_signed_payment() {
    let (state, ledger) = make_state(120);
    let config = Arc::clone(&state.config);
    let signer = PrivateKeySigner::random();
    ledger.credit(usdc(&config), signer.address(), U256::from(1_000_000u64));

    let app = test::init_service(
        App::new()
            .app_data(state)
            .service(routes::verify),
    )
    .await;

    let header = signed_header(&config, &signer, 1_000_000, u64::MAX, 1);
    let req = test::TestRequest::post()
        .uri("/verify")
        .insert_header(("Content-Type", "application/json"))
        .set_payload(payment_body(&config, header))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["isValid"], true);
    assert_eq!(body["invalidReason"], serde_json::Value::Null);
    assert_eq!(body["feeAmount"], "10000");
    assert_eq!(body["netAmount"], "990000");
}

#[actix_rt::test]
async fn verify_reports_expired_with_stable_reason() {
    let (state, ledger) = make_state(120);
    let config = Arc::clone(&state.config);
    let signer = PrivateKeySigner::random();
    ledger.credit(usdc(&config), signer.address(), U256::from(1_000_000u64));

    let app = test::init_service(App::new().app_data(state).service(routes::verify)).await;

    let header = signed_header(&config, &signer, 1_000_000, 1_000, 2);
    let req = test::TestRequest::post()
        .uri("/verify")
        .insert_header(("Content-Type", "application/json"))
        .set_payload(payment_body(&config, header))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["isValid"], false);
    assert_eq!(body["invalidReason"], "Expired");
}

#[actix_rt::test]
async fn settle_is_idempotent_under_a_client_key() {
    let (state, ledger) = make_state(120);
    let config = Arc::clone(&state.config);
    let signer = PrivateKeySigner::random();
    ledger.credit(usdc(&config), signer.address(), U256::from(10_000_000u64));

    let app = test::init_service(App::new().app_data(state).service(routes::settle)).await;

    let header = signed_header(&config, &signer, 1_000_000, u64::MAX, 3);
    let body = payment_body(&config, header);

    let post = |body: Vec<u8>| {
        test::TestRequest::post()
            .uri("/settle")
            .insert_header(("Content-Type", "application/json"))
            .insert_header(("Idempotency-Key", "key-abc"))
            .set_payload(body)
            .to_request()
    };

    let first = test::call_service(&app, post(body.clone())).await;
    assert_eq!(first.status(), 200);
    let first_bytes = test::read_body(first).await;
    let parsed: serde_json::Value = serde_json::from_slice(&first_bytes).unwrap();
    assert_eq!(parsed["success"], true);
    assert_eq!(parsed["status"], "pending");
    assert!(parsed["txHash"].as_str().unwrap().starts_with("0x"));
    assert_eq!(parsed["feeAmount"], "10000");

    // Byte-identical replay, exactly one on-chain settlement (two legs).
    let second = test::call_service(&app, post(body.clone())).await;
    assert_eq!(second.status(), 200);
    let second_bytes = test::read_body(second).await;
    assert_eq!(first_bytes, second_bytes);
    assert_eq!(ledger.transfer_count(), 2);

    // Same key, different payload: conflict, nothing submitted.
    let other_header = signed_header(&config, &signer, 1_000_000, u64::MAX, 4);
    let conflicting = test::call_service(&app, post(payment_body(&config, other_header))).await;
    assert_eq!(conflicting.status(), 409);
    assert_eq!(ledger.transfer_count(), 2);
}

#[actix_rt::test]
async fn settle_rejects_unverified_payments_without_submitting() {
    let (state, ledger) = make_state(120);
    let config = Arc::clone(&state.config);
    let signer = PrivateKeySigner::random();
    // No balance credited: verification fails before any submission.

    let app = test::init_service(App::new().app_data(state).service(routes::settle)).await;

    let header = signed_header(&config, &signer, 1_000_000, u64::MAX, 5);
    let req = test::TestRequest::post()
        .uri("/settle")
        .insert_header(("Content-Type", "application/json"))
        .set_payload(payment_body(&config, header))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "InsufficientBalance");
    assert_eq!(body["txHash"], serde_json::Value::Null);
    assert_eq!(ledger.transfer_count(), 0);
}

#[actix_rt::test]
async fn rate_limit_returns_retry_after_hint() {
    let (state, _ledger) = make_state(1);
    let config = Arc::clone(&state.config);
    let app = test::init_service(App::new().app_data(state).service(routes::verify)).await;

    let make = || {
        test::TestRequest::post()
            .uri("/verify")
            .insert_header(("Content-Type", "application/json"))
            .set_payload(payment_body(
                &config,
                "e30=".to_string(), // base64 "{}"
            ))
            .to_request()
    };

    let first = test::call_service(&app, make()).await;
    assert_ne!(first.status(), 429);

    let second = test::call_service(&app, make()).await;
    assert_eq!(second.status(), 429);
    let body: serde_json::Value = test::read_body_json(second).await;
    let retry_after = body["retryAfter"].as_u64().unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);
}

#[actix_rt::test]
async fn malformed_body_is_a_400() {
    let (state, _ledger) = make_state(120);
    let app = test::init_service(App::new().app_data(state).service(routes::settle)).await;

    let req = test::TestRequest::post()
        .uri("/settle")
        .insert_header(("Content-Type", "application/json"))
        .set_payload("not json at all")
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[actix_rt::test]
async fn malformed_header_is_a_400_with_reason() {
    let (state, _ledger) = make_state(120);
    let config = Arc::clone(&state.config);
    let app = test::init_service(App::new().app_data(state).service(routes::verify)).await;

    // Valid base64, but the decoded object matches no known shape.
    let header =
        base64::engine::general_purpose::STANDARD.encode(br#"{"unexpected": "shape"}"#);
    let req = test::TestRequest::post()
        .uri("/verify")
        .insert_header(("Content-Type", "application/json"))
        .set_payload(payment_body(&config, header))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[actix_rt::test]
async fn metrics_are_forbidden_without_a_token() {
    let (state, _ledger) = make_state(120);
    let app =
        test::init_service(App::new().app_data(state).service(routes::metrics_endpoint)).await;

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
}

#[actix_rt::test]
async fn health_reports_sim_networks_as_reachable() {
    let (state, _ledger) = make_state(120);
    let app = test::init_service(App::new().app_data(state).service(routes::health)).await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["networks"][NETWORK]["status"], "ok");
}
