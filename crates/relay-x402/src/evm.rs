//! RPC-backed [`Ledger`] for EVM networks.

use std::time::Duration;

use alloy::primitives::{Address, FixedBytes, TxHash, U256};
use alloy::providers::Provider;
use alloy::sol;
use async_trait::async_trait;

use crate::error::X402Error;
use crate::ledger::{Ledger, TransferRequest, TxOutcome, TxStatus};

// ERC-20 with the EIP-3009 authorized-transfer extension (USDC et al).
sol! {
    #[sol(rpc)]
    interface ERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function transferFrom(address from, address to, uint256 value) external returns (bool);
        function authorizationState(address authorizer, bytes32 nonce) external view returns (bool);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
}

/// One EVM network's ledger, bound to a provider at construction.
pub struct EvmLedger<P> {
    provider: P,
    submit_timeout: Duration,
}

impl<P> EvmLedger<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            submit_timeout: Duration::from_secs(30),
        }
    }

    /// Override the submission deadline (default 30s).
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }
}

#[async_trait]
impl<P> Ledger for EvmLedger<P>
where
    P: Provider + Send + Sync,
{
    async fn read_balance(&self, asset: Address, owner: Address) -> Result<U256, X402Error> {
        let contract = ERC20::new(asset, &self.provider);
        contract
            .balanceOf(owner)
            .call()
            .await
            .map_err(|e| X402Error::LedgerError(format!("balanceOf failed: {e}")))
    }

    async fn nonce_used(
        &self,
        asset: Address,
        owner: Address,
        nonce: FixedBytes<32>,
    ) -> Result<bool, X402Error> {
        let contract = ERC20::new(asset, &self.provider);
        contract
            .authorizationState(owner, nonce)
            .call()
            .await
            .map_err(|e| X402Error::LedgerError(format!("authorizationState failed: {e}")))
    }

    async fn submit_transfer(&self, transfer: TransferRequest) -> Result<TxHash, X402Error> {
        let contract = ERC20::new(transfer.asset, &self.provider);

        // Timeout on send() only; the transaction may still land after the
        // deadline, which is why this maps to Timeout (outcome unknown)
        // rather than a failure.
        let pending = match &transfer.auth {
            None => {
                tokio::time::timeout(
                    self.submit_timeout,
                    contract
                        .transferFrom(transfer.from, transfer.to, transfer.value)
                        .send(),
                )
                .await
            }
            Some(auth) => {
                let parts = auth.signature.ok_or_else(|| {
                    X402Error::MalformedSignature(
                        "authorized transfer requires a signature".to_string(),
                    )
                })?;
                tokio::time::timeout(
                    self.submit_timeout,
                    contract
                        .transferWithAuthorization(
                            auth.from,
                            auth.to,
                            auth.value,
                            U256::from(auth.valid_after),
                            U256::from(auth.valid_before),
                            auth.nonce,
                            parts.v,
                            parts.r,
                            parts.s,
                        )
                        .send(),
                )
                .await
            }
        };

        let pending = pending
            .map_err(|_| X402Error::Timeout("transfer submission".to_string()))?
            .map_err(|e| X402Error::LedgerRejected(format!("transfer send failed: {e}")))?;

        Ok(*pending.tx_hash())
    }

    async fn confirmations(&self, tx_hash: TxHash) -> Result<Option<TxStatus>, X402Error> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| X402Error::LedgerError(format!("receipt lookup failed: {e}")))?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };

        let current = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| X402Error::LedgerError(format!("block number failed: {e}")))?;

        let included_at = receipt.block_number.unwrap_or(current);
        Ok(Some(TxStatus {
            confirmations: current.saturating_sub(included_at),
            outcome: if receipt.status() {
                TxOutcome::Success
            } else {
                TxOutcome::Reverted
            },
        }))
    }

    async fn height(&self) -> Result<u64, X402Error> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| X402Error::LedgerError(format!("block number failed: {e}")))
    }
}
