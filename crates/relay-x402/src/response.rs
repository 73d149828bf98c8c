//! Wire responses for the facilitator's verify and settle surface.
//!
//! Monetary fields are base-unit integer strings, never floating point.
//! The consensus proof is an opaque token produced by an external
//! aggregation layer; it is echoed, never generated or validated here.

use serde::{Deserialize, Serialize};

use crate::fees::FeeBreakdown;
use crate::settle::{SettlementRecord, SettlementStatus};
use crate::verify::VerificationResult;

/// Response of `POST /verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    /// Observed balance, base units. Diagnostic on balance failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_bps: Option<u16>,
    pub consensus_proof: Option<String>,
}

impl VerifyResponse {
    /// Build the wire response from an engine result, attaching the fee
    /// preview for accepted payments.
    pub fn from_result(
        result: &VerificationResult,
        fee: Option<&FeeBreakdown>,
        consensus_proof: Option<String>,
    ) -> Self {
        Self {
            is_valid: result.is_valid,
            invalid_reason: result.invalid_reason.map(|r| r.as_str().to_string()),
            payer: result.payer.map(|a| format!("{a}")),
            balance: result.balance.clone(),
            decimals: result.decimals,
            fee_amount: fee.map(|f| f.fee.to_string()),
            net_amount: fee.map(|f| f.net.to_string()),
            fee_bps: fee.map(|f| f.fee_bps),
            consensus_proof,
        }
    }
}

/// Response of `POST /settle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    pub error: Option<String>,
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_tx_hash: Option<String>,
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SettlementStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_proof: Option<String>,
}

impl SettleResponse {
    /// Settlement refused by verification: not an error, a normal outcome.
    pub fn rejected(reason: String, network: &str) -> Self {
        Self {
            success: false,
            error: Some(reason),
            tx_hash: None,
            fee_tx_hash: None,
            network: Some(network.to_string()),
            status: None,
            fee_amount: None,
            net_amount: None,
            consensus_proof: None,
        }
    }

    /// Successful (or partial) submission.
    ///
    /// `partial_settlement` reports `success: true` with its distinct
    /// status; it is neither a clean success nor a clean failure and must
    /// never be retried blindly.
    pub fn settled(
        record: &SettlementRecord,
        fee: &FeeBreakdown,
        consensus_proof: Option<String>,
    ) -> Self {
        Self {
            success: record.status != SettlementStatus::Failed,
            error: None,
            tx_hash: Some(record.tx_hash.clone()),
            fee_tx_hash: record.fee_tx_hash.clone(),
            network: Some(record.network.clone()),
            status: Some(record.status),
            fee_amount: Some(fee.fee.to_string()),
            net_amount: Some(fee.net.to_string()),
            consensus_proof,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_settle_serializes_with_reason() {
        let resp = SettleResponse::rejected("Expired".to_string(), "base-sepolia");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Expired");
        assert_eq!(json["txHash"], serde_json::Value::Null);
        assert_eq!(json["network"], "base-sepolia");
        assert!(json.get("feeTxHash").is_none());
    }
}
