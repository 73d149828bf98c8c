//! Authorization normalization: collapse the heterogeneous wire encodings
//! of a payment authorization into the canonical [`Authorization`].
//!
//! Three shapes are recognized, tried in order:
//!
//! 1. nested: `{"payload": {"authorization": {...}, "signature"?}, "signature"?}`
//! 2. flat EIP-3009: `{"from", "to", "value", "validAfter", "validBefore",
//!    "nonce", "v"/"r"/"s" or "signature"}`
//! 3. legacy: `{"sender", "nonce", "validAfter"?, "validBefore"?,
//!    "signature"?}` with `to`/`value` borrowed from the requirements
//!
//! The header itself is either a base64-encoded JSON blob or an
//! already-decoded object. Anything else is `MalformedAuthorization`;
//! signatures of the wrong length are `MalformedSignature`.

use alloy::primitives::{keccak256, FixedBytes, U256};
use base64::Engine;
use serde::{Deserialize, Deserializer};

use crate::error::X402Error;
use crate::payment::{
    parse_address_ci, Authorization, PaymentHeader, PaymentRequirements, SignatureParts,
};

fn de_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    // Timestamps arrive as JSON numbers from some clients and as decimal
    // strings from others.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Num(n)) => Ok(Some(n)),
        Some(Raw::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

fn de_amount<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(n) => n.to_string(),
        Raw::Str(s) => s,
    })
}

/// Common authorization fields of the nested and flat shapes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExactFields {
    from: String,
    to: String,
    #[serde(deserialize_with = "de_amount")]
    value: String,
    #[serde(default, deserialize_with = "de_opt_u64")]
    valid_after: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    valid_before: Option<u64>,
    nonce: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedShape {
    payload: NestedPayload,
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedPayload {
    authorization: ExactFields,
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExactShape {
    #[serde(flatten)]
    auth: ExactFields,
    v: Option<u8>,
    r: Option<String>,
    s: Option<String>,
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyShape {
    sender: String,
    nonce: String,
    #[serde(default, deserialize_with = "de_opt_u64")]
    valid_after: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    valid_before: Option<u64>,
    signature: Option<String>,
}

/// Normalize a payment header into the canonical [`Authorization`].
///
/// The requirements supply `to`/`value` for the legacy shape, which carries
/// neither.
pub fn normalize(
    header: &PaymentHeader,
    requirements: &PaymentRequirements,
) -> Result<Authorization, X402Error> {
    let value = decode_header(header)?;
    let obj = value.as_object().ok_or_else(|| {
        X402Error::MalformedAuthorization("payment header is not a JSON object".to_string())
    })?;

    if obj.contains_key("payload") {
        let shape: NestedShape = serde_json::from_value(value.clone())
            .map_err(|e| X402Error::MalformedAuthorization(format!("nested shape: {e}")))?;
        let signature = shape
            .payload
            .signature
            .as_deref()
            .or(shape.signature.as_deref())
            .map(SignatureParts::from_compact_hex)
            .transpose()?;
        from_exact_fields(shape.payload.authorization, signature)
    } else if obj.contains_key("from") {
        let shape: ExactShape = serde_json::from_value(value.clone())
            .map_err(|e| X402Error::MalformedAuthorization(format!("eip-3009 shape: {e}")))?;
        let signature = resolve_signature(shape.v, shape.r, shape.s, shape.signature.as_deref())?;
        from_exact_fields(shape.auth, signature)
    } else if obj.contains_key("sender") {
        let shape: LegacyShape = serde_json::from_value(value.clone())
            .map_err(|e| X402Error::MalformedAuthorization(format!("legacy shape: {e}")))?;
        from_legacy(shape, requirements)
    } else {
        Err(X402Error::MalformedAuthorization(
            "unrecognized payment header shape".to_string(),
        ))
    }
}

/// Decode the header into a JSON value: base64-encoded JSON or a
/// pass-through object.
fn decode_header(header: &PaymentHeader) -> Result<serde_json::Value, X402Error> {
    match header {
        PaymentHeader::Decoded(value) => Ok(value.clone()),
        PaymentHeader::Encoded(s) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(s.trim())
                .map_err(|e| {
                    X402Error::MalformedAuthorization(format!("invalid base64 header: {e}"))
                })?;
            serde_json::from_slice(&bytes).map_err(|e| {
                X402Error::MalformedAuthorization(format!("header is not valid JSON: {e}"))
            })
        }
    }
}

/// Combine pre-split v/r/s components or a 65-byte compact signature.
fn resolve_signature(
    v: Option<u8>,
    r: Option<String>,
    s: Option<String>,
    compact: Option<&str>,
) -> Result<Option<SignatureParts>, X402Error> {
    match (v, r, s) {
        (Some(v), Some(r), Some(s)) => {
            let r = parse_word(&r, "r")?;
            let s = parse_word(&s, "s")?;
            Ok(Some(SignatureParts { v, r, s }))
        }
        (None, None, None) => compact.map(SignatureParts::from_compact_hex).transpose(),
        _ => Err(X402Error::MalformedSignature(
            "incomplete v/r/s signature components".to_string(),
        )),
    }
}

fn parse_word(s: &str, field: &str) -> Result<alloy::primitives::B256, X402Error> {
    let bytes = alloy::hex::decode(s.strip_prefix("0x").unwrap_or(s))
        .map_err(|e| X402Error::MalformedSignature(format!("invalid {field} component: {e}")))?;
    if bytes.len() != 32 {
        return Err(X402Error::MalformedSignature(format!(
            "{field} component must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(alloy::primitives::B256::from_slice(&bytes))
}

fn from_exact_fields(
    fields: ExactFields,
    signature: Option<SignatureParts>,
) -> Result<Authorization, X402Error> {
    let from = parse_address_ci(&fields.from).ok_or_else(|| {
        X402Error::MalformedAuthorization(format!("invalid from address: {}", fields.from))
    })?;
    let to = parse_address_ci(&fields.to).ok_or_else(|| {
        X402Error::MalformedAuthorization(format!("invalid to address: {}", fields.to))
    })?;
    let value = parse_value(&fields.value)?;
    build(
        from,
        to,
        value,
        fields.valid_after,
        fields.valid_before,
        &fields.nonce,
        signature,
    )
}

fn from_legacy(
    shape: LegacyShape,
    requirements: &PaymentRequirements,
) -> Result<Authorization, X402Error> {
    let from = parse_address_ci(&shape.sender).ok_or_else(|| {
        X402Error::MalformedAuthorization(format!("invalid sender address: {}", shape.sender))
    })?;
    // The legacy shape names no recipient or amount; the requirements are
    // authoritative for both.
    let to = parse_address_ci(&requirements.pay_to).ok_or_else(|| {
        X402Error::MalformedAuthorization(format!(
            "requirements payTo is not a valid address: {}",
            requirements.pay_to
        ))
    })?;
    let value = parse_value(&requirements.max_amount_required)?;
    let signature = shape
        .signature
        .as_deref()
        .map(SignatureParts::from_compact_hex)
        .transpose()?;
    build(
        from,
        to,
        value,
        shape.valid_after,
        shape.valid_before,
        &shape.nonce,
        signature,
    )
}

fn build(
    from: alloy::primitives::Address,
    to: alloy::primitives::Address,
    value: U256,
    valid_after: Option<u64>,
    valid_before: Option<u64>,
    nonce: &str,
    signature: Option<SignatureParts>,
) -> Result<Authorization, X402Error> {
    let valid_after = valid_after.unwrap_or(0);
    let valid_before = valid_before.unwrap_or(u64::MAX);
    if valid_after > valid_before {
        return Err(X402Error::MalformedAuthorization(format!(
            "validAfter {valid_after} exceeds validBefore {valid_before}"
        )));
    }
    Ok(Authorization {
        from,
        to,
        value,
        valid_after,
        valid_before,
        nonce: parse_nonce(nonce),
        signature,
    })
}

fn parse_value(s: &str) -> Result<U256, X402Error> {
    s.trim()
        .parse::<U256>()
        .map_err(|e| X402Error::MalformedAuthorization(format!("invalid value {s:?}: {e}")))
}

/// Map a wire nonce to the fixed-width canonical form.
///
/// A 32-byte hex nonce is taken verbatim; anything else (legacy free-form
/// strings) is hashed to 32 bytes so downstream replay tracking always sees
/// a fixed-width identifier.
pub fn parse_nonce(s: &str) -> FixedBytes<32> {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    if hex.len() == 64 {
        if let Ok(bytes) = alloy::hex::decode(hex) {
            return FixedBytes::from_slice(&bytes);
        }
    }
    keccak256(s.as_bytes())
}
