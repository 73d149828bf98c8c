//! The ledger capability: the facilitator's window onto chain state.
//!
//! Each [`Ledger`] instance is bound to one network at construction, so no
//! method takes a network parameter. [`crate::EvmLedger`] is the RPC-backed
//! implementation; [`SimLedger`] is a deterministic in-process ledger used
//! for simulation mode and tests.

use std::sync::atomic::{AtomicU64, Ordering};

use alloy::primitives::{keccak256, Address, FixedBytes, TxHash, U256};
use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::X402Error;
use crate::payment::Authorization;

/// Final outcome of an included transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Success,
    Reverted,
}

/// Confirmation depth and outcome of an included transaction.
#[derive(Debug, Clone, Copy)]
pub struct TxStatus {
    pub confirmations: u64,
    pub outcome: TxOutcome,
}

/// One transfer to submit.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub asset: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    /// Authorization nonce consumed by the ledger's replay guard. Set on
    /// the primary leg of a settlement, absent on the fee leg.
    pub nonce: Option<FixedBytes<32>>,
    /// Full authorization for signed-transfer execution. `None` selects a
    /// plain pre-approved `transferFrom`.
    pub auth: Option<Authorization>,
}

/// Chain read/write capability consumed by the verification and settlement
/// engines.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Balance of `owner` in `asset`, base units.
    async fn read_balance(&self, asset: Address, owner: Address) -> Result<U256, X402Error>;

    /// Whether `nonce` has already been consumed for `owner`. The nonce
    /// registry lives on the token contract, hence the asset parameter.
    async fn nonce_used(
        &self,
        asset: Address,
        owner: Address,
        nonce: FixedBytes<32>,
    ) -> Result<bool, X402Error>;

    /// Submit a transfer. Fails with [`X402Error::LedgerRejected`] on
    /// revert or replay, [`X402Error::Timeout`] when the outcome is
    /// unknown. Returns as soon as the transaction hash exists; callers
    /// must not assume inclusion.
    async fn submit_transfer(&self, transfer: TransferRequest) -> Result<TxHash, X402Error>;

    /// Confirmation status of a submitted transaction. `None` until the
    /// transaction is included in a block.
    async fn confirmations(&self, tx_hash: TxHash) -> Result<Option<TxStatus>, X402Error>;

    /// Current chain height. Used by health checks.
    async fn height(&self) -> Result<u64, X402Error>;
}

#[derive(Debug, Clone, Copy)]
struct SimTx {
    included_at: u64,
    outcome: TxOutcome,
}

/// Deterministic in-memory ledger.
///
/// Models the pieces of chain behavior the engines depend on: balances,
/// the per-authorizer nonce replay guard (claimed atomically at
/// submission), and confirmation depth that only grows when blocks are
/// mined explicitly. Failure injection (`reject_transfers_to`,
/// `revert_tx`) exists for exercising the partial-settlement and
/// reconciliation paths.
pub struct SimLedger {
    balances: DashMap<(Address, Address), U256>,
    used_nonces: DashMap<(Address, FixedBytes<32>), ()>,
    txs: DashMap<TxHash, SimTx>,
    height: AtomicU64,
    sequence: AtomicU64,
    rejected_recipients: DashMap<Address, ()>,
}

impl SimLedger {
    pub fn new() -> Self {
        Self {
            balances: DashMap::new(),
            used_nonces: DashMap::new(),
            txs: DashMap::new(),
            height: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
            rejected_recipients: DashMap::new(),
        }
    }

    /// Credit `owner` with `amount` of `asset`.
    pub fn credit(&self, asset: Address, owner: Address, amount: U256) {
        *self
            .balances
            .entry((asset, owner))
            .or_insert(U256::ZERO) += amount;
    }

    pub fn balance(&self, asset: Address, owner: Address) -> U256 {
        self.balances
            .get(&(asset, owner))
            .map(|b| *b)
            .unwrap_or_default()
    }

    /// Mark a nonce consumed without a transfer.
    pub fn consume_nonce(&self, owner: Address, nonce: FixedBytes<32>) {
        self.used_nonces.insert((owner, nonce), ());
    }

    /// Make every transfer to `recipient` revert at submission.
    pub fn reject_transfers_to(&self, recipient: Address) {
        self.rejected_recipients.insert(recipient, ());
    }

    /// Rewrite an included transaction's outcome to reverted.
    pub fn revert_tx(&self, tx_hash: TxHash) {
        if let Some(mut tx) = self.txs.get_mut(&tx_hash) {
            tx.outcome = TxOutcome::Reverted;
        }
    }

    /// Mine `blocks` new blocks, deepening every inclusion.
    pub fn mine(&self, blocks: u64) {
        self.height.fetch_add(blocks, Ordering::SeqCst);
    }

    /// Number of transfers that landed.
    pub fn transfer_count(&self) -> usize {
        self.txs.len()
    }
}

impl Default for SimLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for SimLedger {
    async fn read_balance(&self, asset: Address, owner: Address) -> Result<U256, X402Error> {
        Ok(self.balance(asset, owner))
    }

    async fn nonce_used(
        &self,
        _asset: Address,
        owner: Address,
        nonce: FixedBytes<32>,
    ) -> Result<bool, X402Error> {
        // The sim tracks nonces per authorizer across all assets.
        Ok(self.used_nonces.contains_key(&(owner, nonce)))
    }

    async fn submit_transfer(&self, transfer: TransferRequest) -> Result<TxHash, X402Error> {
        if self.rejected_recipients.contains_key(&transfer.to) {
            return Err(X402Error::LedgerRejected(format!(
                "transfer to {} reverted",
                transfer.to
            )));
        }

        let balance = self.balance(transfer.asset, transfer.from);
        if balance < transfer.value {
            return Err(X402Error::LedgerRejected(format!(
                "insufficient funds: balance {balance} < value {}",
                transfer.value
            )));
        }

        // Replay guard: the primary leg claims the authorization nonce
        // atomically. The DashMap entry API makes concurrent double-submits
        // lose here, mirroring on-chain authorization state.
        if let Some(nonce) = transfer.nonce {
            use dashmap::mapref::entry::Entry;
            match self.used_nonces.entry((transfer.from, nonce)) {
                Entry::Occupied(_) => {
                    return Err(X402Error::LedgerRejected(
                        "authorization nonce already used".to_string(),
                    ));
                }
                Entry::Vacant(v) => {
                    v.insert(());
                }
            }
        }

        *self
            .balances
            .entry((transfer.asset, transfer.from))
            .or_insert(U256::ZERO) -= transfer.value;
        *self
            .balances
            .entry((transfer.asset, transfer.to))
            .or_insert(U256::ZERO) += transfer.value;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut preimage = Vec::with_capacity(20 + 20 + 32 + 8);
        preimage.extend_from_slice(transfer.from.as_slice());
        preimage.extend_from_slice(transfer.to.as_slice());
        preimage.extend_from_slice(&transfer.value.to_be_bytes::<32>());
        preimage.extend_from_slice(&seq.to_be_bytes());
        let hash = TxHash::from(keccak256(&preimage));

        self.txs.insert(
            hash,
            SimTx {
                included_at: self.height.load(Ordering::SeqCst),
                outcome: TxOutcome::Success,
            },
        );
        Ok(hash)
    }

    async fn confirmations(&self, tx_hash: TxHash) -> Result<Option<TxStatus>, X402Error> {
        Ok(self.txs.get(&tx_hash).map(|tx| TxStatus {
            confirmations: self
                .height
                .load(Ordering::SeqCst)
                .saturating_sub(tx.included_at),
            outcome: tx.outcome,
        }))
    }

    async fn height(&self) -> Result<u64, X402Error> {
        Ok(self.height.load(Ordering::SeqCst))
    }
}
