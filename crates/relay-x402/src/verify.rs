//! The verification engine: decides whether an authorization is acceptable
//! against the requirements and a point-in-time ledger snapshot.
//!
//! Pure with respect to state: the engine performs reads only and is safe
//! to call any number of times for the same authorization.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::config::FacilitatorConfig;
use crate::error::X402Error;
use crate::ledger::Ledger;
use crate::payment::{parse_address_ci, Authorization, PaymentRequirements};
use crate::signature::{transfer_domain, SignatureVerifier};
use crate::unix_now;

/// Stable rejection reasons. The serialized form is the wire string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidReason {
    UnsupportedNetwork,
    UnsupportedAsset,
    NotYetValid,
    Expired,
    NonceReused,
    InsufficientBalance,
    AmountExceedsMaximum,
    RecipientMismatch,
    InvalidSignature,
}

impl InvalidReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedNetwork => "UnsupportedNetwork",
            Self::UnsupportedAsset => "UnsupportedAsset",
            Self::NotYetValid => "NotYetValid",
            Self::Expired => "Expired",
            Self::NonceReused => "NonceReused",
            Self::InsufficientBalance => "InsufficientBalance",
            Self::AmountExceedsMaximum => "AmountExceedsMaximum",
            Self::RecipientMismatch => "RecipientMismatch",
            Self::InvalidSignature => "InvalidSignature",
        }
    }
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a verification pass. Rejections are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub is_valid: bool,
    pub invalid_reason: Option<InvalidReason>,
    pub payer: Option<Address>,
    /// Observed balance, base units. Diagnostic, set on balance failures.
    pub balance: Option<String>,
    pub decimals: Option<u8>,
}

impl VerificationResult {
    fn valid(payer: Address) -> Self {
        Self {
            is_valid: true,
            invalid_reason: None,
            payer: Some(payer),
            balance: None,
            decimals: None,
        }
    }

    fn invalid(reason: InvalidReason) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason),
            payer: None,
            balance: None,
            decimals: None,
        }
    }

    fn invalid_for(reason: InvalidReason, payer: Address) -> Self {
        Self {
            payer: Some(payer),
            ..Self::invalid(reason)
        }
    }
}

/// Runs the ordered acceptance checks. Cheap, local checks run before
/// ledger reads so failures are deterministic and inexpensive to report.
pub struct VerificationEngine {
    config: Arc<FacilitatorConfig>,
    ledgers: HashMap<String, Arc<dyn Ledger>>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl VerificationEngine {
    pub fn new(
        config: Arc<FacilitatorConfig>,
        ledgers: HashMap<String, Arc<dyn Ledger>>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            config,
            ledgers,
            verifier,
        }
    }

    pub fn ledger(&self, network: &str) -> Option<&Arc<dyn Ledger>> {
        self.ledgers.get(network)
    }

    /// Verify an authorization against the requirements and current ledger
    /// state. Performs no writes.
    ///
    /// Checks, in order, short-circuiting on the first failure:
    /// network/asset support, time window, nonce replay, balance, amount
    /// bound, recipient match, signature.
    pub async fn verify(
        &self,
        requirements: &PaymentRequirements,
        auth: &Authorization,
    ) -> Result<VerificationResult, X402Error> {
        // 1. Network and asset must be registered.
        let Some(network) = self.config.network(&requirements.network) else {
            return Ok(VerificationResult::invalid(
                InvalidReason::UnsupportedNetwork,
            ));
        };
        let Some(ledger) = self.ledgers.get(&requirements.network) else {
            return Ok(VerificationResult::invalid(
                InvalidReason::UnsupportedNetwork,
            ));
        };
        let Some(asset) = parse_address_ci(&requirements.asset).and_then(|a| network.asset(a))
        else {
            return Ok(VerificationResult::invalid(InvalidReason::UnsupportedAsset));
        };

        // 2. Time window: valid_after <= now <= valid_before.
        let now = unix_now()?;
        if now < auth.valid_after {
            return Ok(VerificationResult::invalid_for(
                InvalidReason::NotYetValid,
                auth.from,
            ));
        }
        if now > auth.valid_before {
            return Ok(VerificationResult::invalid_for(
                InvalidReason::Expired,
                auth.from,
            ));
        }

        // 3. Replay: the nonce must be unconsumed on the ledger. Not atomic
        // with settlement submission; the ledger's own replay guard decides
        // concurrent races at submit time.
        if ledger.nonce_used(asset.address, auth.from, auth.nonce).await? {
            tracing::warn!(
                payer = %auth.from,
                nonce = %auth.nonce,
                "replayed nonce rejected"
            );
            return Ok(VerificationResult::invalid_for(
                InvalidReason::NonceReused,
                auth.from,
            ));
        }

        // 4. Balance must cover the authorized value.
        let balance = ledger.read_balance(asset.address, auth.from).await?;
        if balance < auth.value {
            tracing::info!(
                payer = %auth.from,
                balance = %balance,
                required = %auth.value,
                "payment rejected: insufficient balance"
            );
            let mut result =
                VerificationResult::invalid_for(InvalidReason::InsufficientBalance, auth.from);
            result.balance = Some(balance.to_string());
            result.decimals = Some(asset.decimals);
            return Ok(result);
        }

        // 5. Authorized value within the server's stated maximum.
        let max_amount = requirements
            .max_amount_required
            .parse::<U256>()
            .map_err(|e| {
                X402Error::MalformedAuthorization(format!(
                    "invalid maxAmountRequired {:?}: {e}",
                    requirements.max_amount_required
                ))
            })?;
        if auth.value > max_amount {
            return Ok(VerificationResult::invalid_for(
                InvalidReason::AmountExceedsMaximum,
                auth.from,
            ));
        }

        // 6. Recipient must be the server's payTo (case-insensitive).
        match parse_address_ci(&requirements.pay_to) {
            Some(pay_to) if pay_to == auth.to => {}
            _ => {
                return Ok(VerificationResult::invalid_for(
                    InvalidReason::RecipientMismatch,
                    auth.from,
                ));
            }
        }

        // 7. Signature must recover to the payer under the asset's domain.
        let domain = transfer_domain(network, asset);
        if !self.verifier.verify(&domain, auth) {
            return Ok(VerificationResult::invalid_for(
                InvalidReason::InvalidSignature,
                auth.from,
            ));
        }

        tracing::info!(
            payer = %auth.from,
            amount = %auth.value,
            network = %requirements.network,
            "payment verification succeeded"
        );
        Ok(VerificationResult::valid(auth.from))
    }
}
