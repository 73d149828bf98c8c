use std::collections::HashMap;
use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::providers::{
    fillers::{
        BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
    },
    Identity, RootProvider,
};

use x402::{
    FacilitatorConfig, FinalityReconciler, IdempotencyGuard, Ledger, RateLimiter,
    SettlementExecutor, VerificationEngine,
};

/// Concrete provider type from `ProviderBuilder::new().wallet(...).connect_http(...)`.
pub type WalletProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

/// Shared application state for the facilitator server.
pub struct AppState {
    pub config: Arc<FacilitatorConfig>,
    pub engine: VerificationEngine,
    pub executor: SettlementExecutor,
    pub reconciler: Arc<FinalityReconciler>,
    pub idempotency: IdempotencyGuard,
    pub rate_limiter: RateLimiter,
    /// Per-network ledger handles, kept for health probes.
    pub ledgers: HashMap<String, Arc<dyn Ledger>>,
    /// Bearer token for the `/metrics` endpoint.
    pub metrics_token: Option<Vec<u8>>,
}
