//! x402 payment facilitation core.
//!
//! Implements the facilitator side of the x402 pay-per-request protocol:
//! a client presents a signed payment authorization (the `X-PAYMENT` header)
//! against a resource server's payment requirements; this crate decides
//! whether the authorization is acceptable, splits the amount between payee
//! and treasury, executes the on-chain transfer(s), and tracks every
//! submitted transfer to a terminal state.
//!
//! # Pipeline
//!
//! - [`normalize::normalize`] collapses the known wire shapes of an
//!   authorization into one canonical [`Authorization`]
//! - [`VerificationEngine`] runs the ordered acceptance checks (pure, no
//!   writes)
//! - [`fees::compute_fee`] produces the basis-point fee split
//! - [`SettlementExecutor`] submits the transfer(s) and persists a
//!   [`SettlementRecord`]
//! - [`FinalityReconciler`] advances pending records to
//!   `confirmed`/`failed` on a polling loop
//! - [`IdempotencyGuard`] and [`RateLimiter`] wrap the request boundary
//!
//! External state lives behind the [`Ledger`], [`SignatureVerifier`] and
//! [`Store`] capabilities. [`SimLedger`] is a deterministic in-process
//! ledger used for simulation mode and tests.
//!
//! # Quick example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use x402::{
//!     Eip712Verifier, FacilitatorConfig, FeePolicy, Ledger, SimLedger,
//!     VerificationEngine,
//! };
//!
//! let treasury = "0x00000000000000000000000000000000000000aa".parse().unwrap();
//! let config = Arc::new(FacilitatorConfig::new(FeePolicy::new(100, treasury).unwrap()));
//!
//! let mut ledgers: HashMap<String, Arc<dyn Ledger>> = HashMap::new();
//! for network in config.networks.keys() {
//!     ledgers.insert(network.clone(), Arc::new(SimLedger::new()));
//! }
//!
//! let engine = VerificationEngine::new(
//!     Arc::clone(&config),
//!     ledgers,
//!     Arc::new(Eip712Verifier),
//! );
//! ```

pub mod config;
pub mod error;
pub mod fees;
pub mod idempotency;
pub mod normalize;
pub mod payment;
pub mod rate_limit;
pub mod response;
pub mod security;
pub mod signature;

pub mod evm;
pub mod ledger;
pub mod reconciler;
pub mod settle;
pub mod store;
pub mod verify;

use alloy::sol;

// EIP-3009 typed struct covered by the payment authorization signature.
// The sol! macro derives SolStruct which provides eip712_signing_hash().
sol! {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

/// Current unix time in seconds.
///
/// A clock before the epoch is a deployment fault, not a payment fault, so
/// it surfaces as a [`X402Error::ConfigError`].
pub(crate) fn unix_now() -> Result<u64, error::X402Error> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| error::X402Error::ConfigError(format!("system time error: {e}")))
}

// Re-exports
pub use config::{AssetConfig, FacilitatorConfig, FeePolicy, NetworkConfig, SettlementMode};
pub use error::X402Error;
pub use fees::{compute_fee, fee_breakdown, AmountBreakdown, FeeBreakdown};
pub use idempotency::IdempotencyGuard;
pub use normalize::normalize;
pub use payment::{Authorization, PaymentHeader, PaymentRequirements, SignatureParts};
pub use rate_limit::RateLimiter;
pub use response::{SettleResponse, VerifyResponse};
pub use signature::{Eip712Verifier, SignatureVerifier};

pub use evm::EvmLedger;
pub use ledger::{Ledger, SimLedger, TransferRequest, TxOutcome, TxStatus};
pub use reconciler::FinalityReconciler;
pub use settle::{SettlementExecutor, SettlementRecord, SettlementStatus};
pub use store::{IdempotencyEntry, MemoryStore, SqliteStore, Store};
pub use verify::{InvalidReason, VerificationEngine, VerificationResult};
