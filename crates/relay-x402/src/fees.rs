//! Fee calculation: basis-point split of a gross amount between payee and
//! treasury, plus the dual base/human quote served to clients.

use alloy::primitives::utils::format_units;
use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

/// Basis-point denominator: 10000 bps = 100%.
pub const FEE_DENOMINATOR_BPS: u16 = 10_000;

/// Integer fee split. Invariant: `fee + net == gross`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub gross: U256,
    pub fee: U256,
    pub net: U256,
    pub fee_bps: u16,
}

/// Split `gross` at `fee_bps`: `fee = floor(gross * fee_bps / 10000)`,
/// `net = gross - fee`. Total for any non-negative integer input.
pub fn compute_fee(gross: U256, fee_bps: u16) -> FeeBreakdown {
    let fee = gross * U256::from(fee_bps) / U256::from(FEE_DENOMINATOR_BPS);
    FeeBreakdown {
        gross,
        fee,
        net: gross - fee,
        fee_bps,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmountField {
    pub human: String,
    pub base: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeField {
    pub human: String,
    pub base: String,
    pub bps: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetField {
    pub human: String,
    pub base: String,
}

/// Fee quote with both base-unit integer strings and human
/// (decimal-shifted) representations. Base units are authoritative; the
/// human strings exist for display only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmountBreakdown {
    pub amount: AmountField,
    pub fee: FeeField,
    pub net: NetField,
}

/// Build the full quote for a gross amount of an asset.
pub fn fee_breakdown(gross: U256, fee_bps: u16, symbol: &str, decimals: u8) -> AmountBreakdown {
    let split = compute_fee(gross, fee_bps);
    AmountBreakdown {
        amount: AmountField {
            human: to_human(split.gross, decimals),
            base: split.gross.to_string(),
            symbol: symbol.to_string(),
            decimals,
        },
        fee: FeeField {
            human: to_human(split.fee, decimals),
            base: split.fee.to_string(),
            bps: split.fee_bps,
        },
        net: NetField {
            human: to_human(split.net, decimals),
            base: split.net.to_string(),
        },
    }
}

/// Decimal-shift a base-unit amount, trimming trailing fractional zeros
/// ("1.000000" renders as "1", "0.010000" as "0.01").
fn to_human(value: U256, decimals: u8) -> String {
    match format_units(value, decimals) {
        Ok(s) => {
            if s.contains('.') {
                s.trim_end_matches('0').trim_end_matches('.').to_string()
            } else {
                s
            }
        }
        Err(_) => value.to_string(),
    }
}
