//! Build the shared [`AppState`] from a resolved configuration.
//!
//! Two modes: `evm` wires one alloy wallet provider per configured
//! network; `sim` wires deterministic in-process ledgers (no chain,
//! useful for demos and tests). The choice is made once here; nothing
//! downstream probes for capabilities at call time.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;

use x402::{
    Eip712Verifier, EvmLedger, FacilitatorConfig, FinalityReconciler, IdempotencyGuard, Ledger,
    RateLimiter, SettlementExecutor, SimLedger, Store, VerificationEngine,
};

use crate::state::AppState;

/// Which ledger backend to wire.
pub enum LedgerMode {
    /// One RPC-backed ledger per network, signing with this private key.
    Evm { private_key: String },
    /// In-process simulation ledgers.
    Sim,
}

/// Assemble the application state and spawn the finality reconciler.
///
/// # Panics
///
/// Exits the process when the private key or an RPC URL cannot be parsed;
/// both are startup configuration faults.
pub fn bootstrap(
    config: FacilitatorConfig,
    mode: LedgerMode,
    store: Arc<dyn Store>,
    metrics_token: Option<Vec<u8>>,
) -> AppState {
    let config = Arc::new(config);

    let ledgers: HashMap<String, Arc<dyn Ledger>> = match mode {
        LedgerMode::Sim => {
            tracing::info!("ledger mode: sim (no chain access)");
            config
                .networks
                .keys()
                .map(|name| (name.clone(), Arc::new(SimLedger::new()) as Arc<dyn Ledger>))
                .collect()
        }
        LedgerMode::Evm { private_key } => {
            let signer: PrivateKeySigner = private_key
                .parse()
                .expect("invalid FACILITATOR_PRIVATE_KEY");
            tracing::info!(facilitator = %signer.address(), "ledger mode: evm");
            let wallet = EthereumWallet::from(signer);

            config
                .networks
                .values()
                .map(|network| {
                    let provider = ProviderBuilder::new()
                        .wallet(wallet.clone())
                        .connect_http(network.rpc_url.parse().unwrap_or_else(|e| {
                            tracing::error!(
                                network = %network.network,
                                url = %network.rpc_url,
                                error = %e,
                                "invalid RPC URL"
                            );
                            std::process::exit(1);
                        }));
                    (
                        network.network.clone(),
                        Arc::new(EvmLedger::new(provider)) as Arc<dyn Ledger>,
                    )
                })
                .collect()
        }
    };

    let engine = VerificationEngine::new(
        Arc::clone(&config),
        ledgers.clone(),
        Arc::new(Eip712Verifier),
    );
    let executor = SettlementExecutor::new(
        Arc::clone(&config),
        ledgers.clone(),
        Arc::clone(&store),
    );
    let reconciler = Arc::new(FinalityReconciler::new(
        Arc::clone(&config),
        ledgers.clone(),
        Arc::clone(&store),
    ));
    Arc::clone(&reconciler).spawn();

    AppState {
        rate_limiter: RateLimiter::new(config.rate_limit_rpm),
        idempotency: IdempotencyGuard::new(Some(store)),
        engine,
        executor,
        reconciler,
        ledgers,
        metrics_token,
        config,
    }
}
