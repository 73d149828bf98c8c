//! Wire and canonical payment types.

use alloy::primitives::{Address, FixedBytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::error::X402Error;

/// Server-declared payment terms (one entry of a 402 `accepts` array).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Maximum charge, base-unit integer string.
    pub max_amount_required: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub pay_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_seconds: Option<u64>,
    /// Token contract address.
    pub asset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// The `X-PAYMENT` header as received: either base64-encoded JSON or an
/// already-decoded object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PaymentHeader {
    Encoded(String),
    Decoded(serde_json::Value),
}

/// Split ECDSA signature components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureParts {
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

impl SignatureParts {
    /// Split a 65-byte compact signature: r = bytes[0..32], s = bytes[32..64],
    /// v = bytes[64]. Any other length is malformed.
    pub fn from_compact(bytes: &[u8]) -> Result<Self, X402Error> {
        if bytes.len() != 65 {
            return Err(X402Error::MalformedSignature(format!(
                "signature must be 65 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            v: bytes[64],
            r: B256::from_slice(&bytes[0..32]),
            s: B256::from_slice(&bytes[32..64]),
        })
    }

    /// Split a hex-encoded compact signature (with or without 0x prefix).
    pub fn from_compact_hex(signature: &str) -> Result<Self, X402Error> {
        let bytes = alloy::hex::decode(signature.strip_prefix("0x").unwrap_or(signature))
            .map_err(|e| X402Error::MalformedSignature(format!("invalid hex signature: {e}")))?;
        Self::from_compact(&bytes)
    }

    /// Re-assemble the 65-byte compact form.
    pub fn to_bytes(self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[0..32].copy_from_slice(self.r.as_slice());
        out[32..64].copy_from_slice(self.s.as_slice());
        out[64] = self.v;
        out
    }
}

/// Canonical payment authorization, produced by
/// [`crate::normalize::normalize`] from any of the supported wire shapes.
///
/// Invariants: `valid_after <= valid_before`; `value` is a non-negative
/// base-unit integer. The signature is optional on the wire (the legacy
/// shape omits it) and its absence fails verification, not normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub valid_after: u64,
    pub valid_before: u64,
    pub nonce: FixedBytes<32>,
    pub signature: Option<SignatureParts>,
}

/// Parse an address case-insensitively.
///
/// Mixed-case input is lowercased before parsing so EIP-55 checksum
/// mismatches never reject an otherwise valid address; recipient matching
/// is defined case-insensitively.
pub fn parse_address_ci(s: &str) -> Option<Address> {
    s.trim().to_ascii_lowercase().parse::<Address>().ok()
}
