//! Finality reconciliation: the background loop that advances submitted
//! settlements to a terminal state.
//!
//! This loop is the sole writer of terminal status. The executor creates
//! records; the reconciler advances them. Transitions are monotonic:
//! `pending`/`partial_settlement` move to `confirmed`/`failed` exactly
//! once, and confirmation counts never decrease.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::TxHash;
use chrono::Utc;

use crate::config::FacilitatorConfig;
use crate::error::X402Error;
use crate::ledger::{Ledger, TxOutcome};
use crate::settle::{SettlementRecord, SettlementStatus};
use crate::store::Store;

pub struct FinalityReconciler {
    config: Arc<FacilitatorConfig>,
    ledgers: HashMap<String, Arc<dyn Ledger>>,
    store: Arc<dyn Store>,
}

impl FinalityReconciler {
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

    /// Start the polling loop on the configured interval.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval_secs = self.config.reconcile_interval_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                let advanced = self.poll_once().await;
                if advanced > 0 {
                    tracing::info!(advanced, "settlements reached terminal status");
                }
            }
        })
    }

    /// One reconciliation pass over the open settlements, oldest first.
    /// A failure on one record is logged and does not block the batch.
    /// Returns the number of records that reached a terminal state.
    pub async fn poll_once(&self) -> usize {
        let open = match self.store.list_by_status(
            &[
                SettlementStatus::Pending,
                SettlementStatus::PartialSettlement,
            ],
            self.config.reconcile_batch,
        ) {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "failed to load open settlements");
                return 0;
            }
        };

        let mut advanced = 0;
        for mut record in open {
            match self.check(&mut record).await {
                Ok(true) => advanced += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "finality check failed");
                }
            }
        }
        advanced
    }

    /// Check one record against the ledger and persist any advance.
    async fn check(&self, record: &mut SettlementRecord) -> Result<bool, X402Error> {
        // Terminal records never come back from list_by_status, but a
        // record racing a concurrent pass must not regress.
        if record.status.is_terminal() {
            return Ok(false);
        }

        let network = self.config.network(&record.network).ok_or_else(|| {
            X402Error::ConfigError(format!("unknown network on record: {}", record.network))
        })?;
        let ledger = self.ledgers.get(&record.network).ok_or_else(|| {
            X402Error::ConfigError(format!("no ledger for network: {}", record.network))
        })?;
        let tx_hash = record.tx_hash.parse::<TxHash>().map_err(|e| {
            X402Error::LedgerError(format!("invalid tx hash {}: {e}", record.tx_hash))
        })?;

        let Some(status) = ledger.confirmations(tx_hash).await? else {
            // Not yet included; nothing to update.
            return Ok(false);
        };

        if status.confirmations >= network.confirmations {
            record.confirmations = record.confirmations.max(status.confirmations);
            record.status = match status.outcome {
                TxOutcome::Success => SettlementStatus::Confirmed,
                TxOutcome::Reverted => SettlementStatus::Failed,
            };
            record.confirmed_at = Some(Utc::now());
            self.store.put_settlement(record)?;
            tracing::info!(
                id = %record.id,
                tx = %record.tx_hash,
                confirmations = record.confirmations,
                status = record.status.as_str(),
                "settlement finalized"
            );
            return Ok(true);
        }

        if status.confirmations > record.confirmations {
            record.confirmations = status.confirmations;
            self.store.put_settlement(record)?;
        }
        Ok(false)
    }
}
