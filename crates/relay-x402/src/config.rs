//! Runtime configuration: network and asset registries, fee policy.
//!
//! Everything is resolved once at startup and injected into components at
//! construction. Components never consult the environment or lazily build
//! clients; a missing capability is a startup error, not a per-call probe.

use std::collections::HashMap;

use alloy::primitives::{address, Address};

use crate::error::X402Error;

/// Default facilitator fee in basis points (1%).
pub const DEFAULT_FEE_BPS: u16 = 100;

/// x402 scheme name served by this facilitator.
pub const SCHEME_NAME: &str = "exact";

/// How settlements execute for a given asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementMode {
    /// The payer holds a standing on-chain allowance; the facilitator issues
    /// a net transfer to the payee and a separate fee transfer to the
    /// treasury. The two legs are independent ledger writes and are not
    /// atomic; a failed fee leg yields `partial_settlement`.
    PreApproved,
    /// The signature covers an exact transfer amount, executed as a single
    /// authorized-transfer call. The signed amount moves in full; the fee
    /// split is off-chain bookkeeping only.
    SignedAuthorization,
}

/// One accepted token on a network.
#[derive(Debug, Clone)]
pub struct AssetConfig {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
    /// EIP-712 domain name/version of the token's authorization scheme.
    pub eip712_name: String,
    pub eip712_version: String,
    pub mode: SettlementMode,
}

/// One supported network, with its finality threshold.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: String,
    pub chain_id: u64,
    pub rpc_url: String,
    /// Confirmation depth treated as final on this network.
    pub confirmations: u64,
    pub explorer_base: String,
    pub assets: Vec<AssetConfig>,
}

impl NetworkConfig {
    /// Look up an accepted asset by contract address.
    pub fn asset(&self, address: Address) -> Option<&AssetConfig> {
        self.assets.iter().find(|a| a.address == address)
    }

    /// Look up an accepted asset by symbol, case-insensitively.
    pub fn asset_by_symbol(&self, symbol: &str) -> Option<&AssetConfig> {
        self.assets
            .iter()
            .find(|a| a.symbol.eq_ignore_ascii_case(symbol))
    }
}

/// Facilitator fee policy: basis points plus the treasury that collects.
#[derive(Debug, Clone)]
pub struct FeePolicy {
    pub fee_bps: u16,
    pub treasury: Address,
}

impl FeePolicy {
    /// Build a fee policy. Rejects `fee_bps` above 10000 (100%).
    pub fn new(fee_bps: u16, treasury: Address) -> Result<Self, X402Error> {
        if fee_bps > crate::fees::FEE_DENOMINATOR_BPS {
            return Err(X402Error::ConfigError(format!(
                "fee_bps {fee_bps} exceeds {}",
                crate::fees::FEE_DENOMINATOR_BPS
            )));
        }
        Ok(Self { fee_bps, treasury })
    }
}

/// Top-level facilitator configuration, injected into every component.
#[derive(Debug, Clone)]
pub struct FacilitatorConfig {
    pub scheme: String,
    pub networks: HashMap<String, NetworkConfig>,
    pub fee: FeePolicy,
    /// Per-identity request ceiling per minute.
    pub rate_limit_rpm: u64,
    /// Finality reconciler poll interval.
    pub reconcile_interval_secs: u64,
    /// Max records loaded per reconciler pass.
    pub reconcile_batch: usize,
    /// Whether settle calls block (bounded) for the confirmation threshold
    /// before responding.
    pub wait_for_confirmations: bool,
}

impl FacilitatorConfig {
    /// Configuration with the default network registry and the given fee
    /// policy.
    pub fn new(fee: FeePolicy) -> Self {
        Self {
            scheme: SCHEME_NAME.to_string(),
            networks: default_networks(),
            fee,
            rate_limit_rpm: 120,
            reconcile_interval_secs: 30,
            reconcile_batch: 50,
            wait_for_confirmations: false,
        }
    }

    pub fn network(&self, network: &str) -> Option<&NetworkConfig> {
        self.networks.get(network)
    }

    /// The (scheme, network) pairs this facilitator serves.
    pub fn supported_kinds(&self) -> Vec<(String, String)> {
        let mut kinds: Vec<_> = self
            .networks
            .keys()
            .map(|n| (self.scheme.clone(), n.clone()))
            .collect();
        kinds.sort();
        kinds
    }
}

fn usdc(address: Address, mode: SettlementMode) -> AssetConfig {
    AssetConfig {
        address,
        symbol: "USDC".to_string(),
        decimals: 6,
        eip712_name: "USD Coin".to_string(),
        eip712_version: "2".to_string(),
        mode,
    }
}

/// The built-in network registry: USDC on Base and Ethereum, testnet and
/// mainnet. RPC URLs are overridable at bootstrap.
pub fn default_networks() -> HashMap<String, NetworkConfig> {
    let networks = [
        NetworkConfig {
            network: "base-sepolia".to_string(),
            chain_id: 84532,
            rpc_url: "https://sepolia.base.org".to_string(),
            confirmations: 2,
            explorer_base: "https://sepolia.basescan.org".to_string(),
            assets: vec![usdc(
                address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
                SettlementMode::PreApproved,
            )],
        },
        NetworkConfig {
            network: "ethereum-sepolia".to_string(),
            chain_id: 11155111,
            rpc_url: "https://ethereum-sepolia-rpc.publicnode.com".to_string(),
            confirmations: 3,
            explorer_base: "https://sepolia.etherscan.io".to_string(),
            assets: vec![usdc(
                address!("0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238"),
                SettlementMode::PreApproved,
            )],
        },
        NetworkConfig {
            network: "base-mainnet".to_string(),
            chain_id: 8453,
            rpc_url: "https://mainnet.base.org".to_string(),
            confirmations: 2,
            explorer_base: "https://basescan.org".to_string(),
            assets: vec![usdc(
                address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
                SettlementMode::PreApproved,
            )],
        },
        NetworkConfig {
            network: "ethereum-mainnet".to_string(),
            chain_id: 1,
            rpc_url: "https://eth.llamarpc.com".to_string(),
            confirmations: 3,
            explorer_base: "https://etherscan.io".to_string(),
            assets: vec![usdc(
                address!("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
                SettlementMode::PreApproved,
            )],
        },
    ];

    networks
        .into_iter()
        .map(|n| (n.network.clone(), n))
        .collect()
}
