//! Settlement execution: the only component that writes to the ledger.
//!
//! Two execution modes, selected per asset by configuration:
//!
//! - pre-approved: net transfer to the payee, then a fee transfer to the
//!   treasury. The legs are independent ledger writes; a failed fee leg is
//!   recorded as `partial_settlement`, a first-class state, not an error.
//! - signed-authorization: one authorized-transfer call moving the full
//!   signed amount; the fee split stays off-chain.
//!
//! The record is persisted with status `pending` (or `partial_settlement`)
//! before any confirmation wait, so a crash between submission and
//! confirmation leaves a recoverable record for the reconciler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::TxHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{FacilitatorConfig, SettlementMode};
use crate::error::X402Error;
use crate::fees::FeeBreakdown;
use crate::ledger::{Ledger, TransferRequest, TxOutcome};
use crate::payment::{parse_address_ci, Authorization, PaymentRequirements};
use crate::store::Store;

/// Default budget for the optional inline confirmation wait.
pub const DEFAULT_SETTLE_WAIT_SECS: u64 = 30;

const CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Lifecycle of a submitted settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    PartialSettlement,
    Confirmed,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PartialSettlement => "partial_settlement",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, X402Error> {
        match s {
            "pending" => Ok(Self::Pending),
            "partial_settlement" => Ok(Self::PartialSettlement),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(X402Error::StoreError(format!(
                "unknown settlement status: {other}"
            ))),
        }
    }

    /// Terminal states are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

/// Persisted settlement entity. Created once by the executor; thereafter
/// only the reconciler advances `status`/`confirmations`. Never deleted,
/// only superseded by status transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub id: String,
    /// Primary transfer hash.
    pub tx_hash: String,
    /// Fee transfer hash, when a second transfer was issued and landed.
    pub fee_tx_hash: Option<String>,
    pub network: String,
    pub status: SettlementStatus,
    pub confirmations: u64,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl SettlementRecord {
    fn submitted(tx_hash: TxHash, network: &str, status: SettlementStatus) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tx_hash: format!("{tx_hash}"),
            fee_tx_hash: None,
            network: network.to_string(),
            status,
            confirmations: 0,
            created_at: Utc::now(),
            confirmed_at: None,
        }
    }
}

/// Executes settlements against the ledger and persists their records.
pub struct SettlementExecutor {
    config: Arc<FacilitatorConfig>,
    ledgers: HashMap<String, Arc<dyn Ledger>>,
    store: Arc<dyn Store>,
}

impl SettlementExecutor {
    pub fn new(
        config: Arc<FacilitatorConfig>,
        ledgers: HashMap<String, Arc<dyn Ledger>>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            config,
            ledgers,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Settle a verified authorization.
    ///
    /// The caller is expected to have run verification first; a failed
    /// primary transfer aborts with [`X402Error::SettlementFailed`] and no
    /// persisted record, so retrying from scratch is safe. A submit
    /// timeout propagates as [`X402Error::Timeout`]: the transfer may have
    /// landed, and the caller must re-query rather than resubmit.
    pub async fn settle(
        &self,
        requirements: &PaymentRequirements,
        auth: &Authorization,
        fee: &FeeBreakdown,
    ) -> Result<SettlementRecord, X402Error> {
        let network = self.config.network(&requirements.network).ok_or_else(|| {
            X402Error::ConfigError(format!("unsupported network: {}", requirements.network))
        })?;
        let asset = parse_address_ci(&requirements.asset)
            .and_then(|a| network.asset(a))
            .ok_or_else(|| {
                X402Error::ConfigError(format!("unsupported asset: {}", requirements.asset))
            })?;
        let ledger = Arc::clone(self.ledgers.get(&requirements.network).ok_or_else(|| {
            X402Error::ConfigError(format!("no ledger for network: {}", requirements.network))
        })?);

        let mut record = match asset.mode {
            SettlementMode::PreApproved => {
                self.settle_pre_approved(&ledger, asset.address, requirements, auth, fee)
                    .await?
            }
            SettlementMode::SignedAuthorization => {
                self.settle_signed(&ledger, asset.address, requirements, auth)
                    .await?
            }
        };

        // Persist before any confirmation wait. A store failure here is
        // surfaced, not swallowed: the transfer landed but cannot be
        // tracked, so the caller must re-query by tx hash.
        if let Err(e) = self.store.put_settlement(&record) {
            tracing::error!(
                id = %record.id,
                tx = %record.tx_hash,
                error = %e,
                "settlement landed but record could not be persisted"
            );
            return Err(e);
        }

        if self.config.wait_for_confirmations && record.status == SettlementStatus::Pending {
            let budget = Duration::from_secs(
                requirements
                    .max_timeout_seconds
                    .unwrap_or(DEFAULT_SETTLE_WAIT_SECS)
                    .min(DEFAULT_SETTLE_WAIT_SECS),
            );
            self.await_confirmations(&ledger, network.confirmations, &mut record, budget)
                .await;
        }

        Ok(record)
    }

    /// Dual transfer: payer -> payee (net), then payer -> treasury (fee).
    async fn settle_pre_approved(
        &self,
        ledger: &Arc<dyn Ledger>,
        asset: alloy::primitives::Address,
        requirements: &PaymentRequirements,
        auth: &Authorization,
        fee: &FeeBreakdown,
    ) -> Result<SettlementRecord, X402Error> {
        let pay_to = parse_address_ci(&requirements.pay_to).ok_or_else(|| {
            X402Error::MalformedAuthorization(format!(
                "requirements payTo is not a valid address: {}",
                requirements.pay_to
            ))
        })?;

        let primary = ledger
            .submit_transfer(TransferRequest {
                asset,
                from: auth.from,
                to: pay_to,
                value: fee.net,
                nonce: Some(auth.nonce),
                auth: None,
            })
            .await
            .map_err(|e| match e {
                // Unknown outcome stays unknown; everything else is a clean
                // abort with nothing persisted.
                X402Error::Timeout(what) => X402Error::Timeout(what),
                other => X402Error::SettlementFailed(format!("primary transfer failed: {other}")),
            })?;

        let mut record =
            SettlementRecord::submitted(primary, &requirements.network, SettlementStatus::Pending);

        if fee.fee > alloy::primitives::U256::ZERO {
            match ledger
                .submit_transfer(TransferRequest {
                    asset,
                    from: auth.from,
                    to: self.config.fee.treasury,
                    value: fee.fee,
                    nonce: None,
                    auth: None,
                })
                .await
            {
                Ok(fee_hash) => {
                    record.fee_tx_hash = Some(format!("{fee_hash}"));
                }
                Err(e) => {
                    // The payee transfer already landed. Two independent
                    // ledger writes cannot be made atomic, so this is the
                    // explicit non-atomicity contract: a terminal-pending
                    // state, not an error to retry blindly.
                    tracing::warn!(
                        payer = %auth.from,
                        tx = %record.tx_hash,
                        error = %e,
                        "fee transfer failed; recording partial settlement"
                    );
                    record.status = SettlementStatus::PartialSettlement;
                }
            }
        }

        tracing::info!(
            payer = %auth.from,
            net = %fee.net,
            fee = %fee.fee,
            tx = %record.tx_hash,
            status = record.status.as_str(),
            "settlement submitted"
        );
        Ok(record)
    }

    /// Single authorized transfer moving the full signed amount. The
    /// signature covers an exact value, so no on-chain re-split is
    /// possible; the fee stays off-chain bookkeeping.
    async fn settle_signed(
        &self,
        ledger: &Arc<dyn Ledger>,
        asset: alloy::primitives::Address,
        requirements: &PaymentRequirements,
        auth: &Authorization,
    ) -> Result<SettlementRecord, X402Error> {
        let primary = ledger
            .submit_transfer(TransferRequest {
                asset,
                from: auth.from,
                to: auth.to,
                value: auth.value,
                nonce: Some(auth.nonce),
                auth: Some(auth.clone()),
            })
            .await
            .map_err(|e| match e {
                X402Error::Timeout(what) => X402Error::Timeout(what),
                other => {
                    X402Error::SettlementFailed(format!("authorized transfer failed: {other}"))
                }
            })?;

        tracing::info!(
            payer = %auth.from,
            amount = %auth.value,
            tx = %primary,
            "authorized transfer submitted"
        );
        Ok(SettlementRecord::submitted(
            primary,
            &requirements.network,
            SettlementStatus::Pending,
        ))
    }

    /// Bounded wait for the network's confirmation threshold.
    ///
    /// Only the returned record is upgraded; terminal status is never
    /// written to the store here. The reconciler is the sole writer of
    /// terminal states, which keeps a single-writer invariant per record.
    /// On budget exhaustion the record stays `pending` and the reconciler
    /// finishes the job.
    async fn await_confirmations(
        &self,
        ledger: &Arc<dyn Ledger>,
        threshold: u64,
        record: &mut SettlementRecord,
        budget: Duration,
    ) {
        let Ok(tx_hash) = record.tx_hash.parse::<TxHash>() else {
            return;
        };
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            match ledger.confirmations(tx_hash).await {
                Ok(Some(status)) => {
                    record.confirmations = record.confirmations.max(status.confirmations);
                    if status.confirmations >= threshold {
                        record.status = match status.outcome {
                            TxOutcome::Success => SettlementStatus::Confirmed,
                            TxOutcome::Reverted => SettlementStatus::Failed,
                        };
                        record.confirmed_at = Some(Utc::now());
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(tx = %record.tx_hash, error = %e, "confirmation poll failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::info!(
                    tx = %record.tx_hash,
                    "confirmation wait budget exhausted; leaving settlement pending"
                );
                return;
            }
            tokio::time::sleep(CONFIRMATION_POLL_INTERVAL).await;
        }
    }
}
