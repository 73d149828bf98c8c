//! Durable storage capability: settlement records and idempotency entries.
//!
//! [`SqliteStore`] is the durable implementation; [`MemoryStore`] is the
//! in-memory stand-in used for tests and for running without persistence.
//! Which one a component holds is decided at construction, never probed per
//! call.

use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::X402Error;
use crate::settle::{SettlementRecord, SettlementStatus};

/// One processed request, kept for replay within the retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub key: String,
    /// SHA-256 of the request body. A second request under the same key
    /// with a different hash is a conflict, never an overwrite.
    pub request_hash: String,
    /// The exact serialized response body, replayed verbatim.
    pub response: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence capability for the settlement subsystem and the idempotency
/// guard.
pub trait Store: Send + Sync {
    /// Insert or update a settlement record.
    fn put_settlement(&self, record: &SettlementRecord) -> Result<(), X402Error>;

    fn get_settlement(&self, id: &str) -> Result<Option<SettlementRecord>, X402Error>;

    /// Records in any of `statuses`, oldest first, at most `limit`.
    fn list_by_status(
        &self,
        statuses: &[SettlementStatus],
        limit: usize,
    ) -> Result<Vec<SettlementRecord>, X402Error>;

    fn put_idempotency(&self, entry: &IdempotencyEntry) -> Result<(), X402Error>;

    fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyEntry>, X402Error>;

    /// Drop idempotency entries older than `max_age_secs`. Returns the
    /// number removed.
    fn purge_expired_idempotency(&self, max_age_secs: u64) -> Result<usize, X402Error>;
}

/// SQLite-backed store. Survives restarts; the reconciler depends on this
/// for crash recovery of in-flight settlements.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// On Unix the file permissions are restricted to 0600 so other system
    /// users cannot read payment data.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settlements (
                id TEXT PRIMARY KEY,
                tx_hash TEXT NOT NULL,
                fee_tx_hash TEXT,
                network TEXT NOT NULL,
                status TEXT NOT NULL,
                confirmations INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                confirmed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_settlements_status
                ON settlements(status, created_at);
            CREATE TABLE IF NOT EXISTS idempotency (
                key TEXT PRIMARY KEY,
                request_hash TEXT NOT NULL,
                response TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_idempotency_created_at
                ON idempotency(created_at);
            PRAGMA journal_mode=WAL;",
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(
                    path = %path,
                    error = %e,
                    "failed to set store file permissions to 0600"
                );
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("store mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn store_err(e: rusqlite::Error) -> X402Error {
    X402Error::StoreError(e.to_string())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SettlementRecord> {
    let status: String = row.get(4)?;
    let status = SettlementStatus::parse(&status).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown settlement status: {status}").into(),
        )
    })?;
    let created_at: i64 = row.get(6)?;
    let confirmed_at: Option<i64> = row.get(7)?;
    Ok(SettlementRecord {
        id: row.get(0)?,
        tx_hash: row.get(1)?,
        fee_tx_hash: row.get(2)?,
        network: row.get(3)?,
        status,
        confirmations: row.get::<_, i64>(5)?.max(0) as u64,
        created_at: from_unix(created_at),
        confirmed_at: confirmed_at.map(from_unix),
    })
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

impl Store for SqliteStore {
    fn put_settlement(&self, record: &SettlementRecord) -> Result<(), X402Error> {
        self.conn()
            .execute(
                "INSERT INTO settlements
                    (id, tx_hash, fee_tx_hash, network, status, confirmations, created_at, confirmed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    tx_hash = excluded.tx_hash,
                    fee_tx_hash = excluded.fee_tx_hash,
                    status = excluded.status,
                    confirmations = excluded.confirmations,
                    confirmed_at = excluded.confirmed_at",
                rusqlite::params![
                    record.id,
                    record.tx_hash,
                    record.fee_tx_hash,
                    record.network,
                    record.status.as_str(),
                    record.confirmations as i64,
                    record.created_at.timestamp(),
                    record.confirmed_at.map(|t| t.timestamp()),
                ],
            )
            .map(|_| ())
            .map_err(store_err)
    }

    fn get_settlement(&self, id: &str) -> Result<Option<SettlementRecord>, X402Error> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, tx_hash, fee_tx_hash, network, status, confirmations,
                        created_at, confirmed_at
                 FROM settlements WHERE id = ?1",
            )
            .map_err(store_err)?;
        let mut rows = stmt
            .query_map([id], row_to_record)
            .map_err(store_err)?;
        rows.next().transpose().map_err(store_err)
    }

    fn list_by_status(
        &self,
        statuses: &[SettlementStatus],
        limit: usize,
    ) -> Result<Vec<SettlementRecord>, X402Error> {
        if statuses.is_empty() {
            return Ok(vec![]);
        }
        let placeholders = vec!["?"; statuses.len()].join(",");
        let sql = format!(
            "SELECT id, tx_hash, fee_tx_hash, network, status, confirmations,
                    created_at, confirmed_at
             FROM settlements WHERE status IN ({placeholders})
             ORDER BY created_at ASC, id ASC LIMIT {limit}"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(statuses.iter().map(|s| s.as_str())),
                row_to_record,
            )
            .map_err(store_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
    }

    fn put_idempotency(&self, entry: &IdempotencyEntry) -> Result<(), X402Error> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO idempotency (key, request_hash, response, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    entry.key,
                    entry.request_hash,
                    entry.response,
                    entry.created_at.timestamp(),
                ],
            )
            .map(|_| ())
            .map_err(store_err)
    }

    fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyEntry>, X402Error> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT key, request_hash, response, created_at FROM idempotency WHERE key = ?1",
            )
            .map_err(store_err)?;
        let mut rows = stmt
            .query_map([key], |row| {
                let created_at: i64 = row.get(3)?;
                Ok(IdempotencyEntry {
                    key: row.get(0)?,
                    request_hash: row.get(1)?,
                    response: row.get(2)?,
                    created_at: from_unix(created_at),
                })
            })
            .map_err(store_err)?;
        rows.next().transpose().map_err(store_err)
    }

    fn purge_expired_idempotency(&self, max_age_secs: u64) -> Result<usize, X402Error> {
        let cutoff = Utc::now().timestamp().saturating_sub(max_age_secs as i64);
        self.conn()
            .execute(
                "DELETE FROM idempotency WHERE created_at < ?1",
                rusqlite::params![cutoff],
            )
            .map_err(store_err)
    }
}

/// In-memory store. Records are lost on restart; suitable for tests and
/// simulation mode only.
pub struct MemoryStore {
    settlements: DashMap<String, SettlementRecord>,
    idempotency: DashMap<String, IdempotencyEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            settlements: DashMap::new(),
            idempotency: DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn put_settlement(&self, record: &SettlementRecord) -> Result<(), X402Error> {
        self.settlements.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn get_settlement(&self, id: &str) -> Result<Option<SettlementRecord>, X402Error> {
        Ok(self.settlements.get(id).map(|r| r.clone()))
    }

    fn list_by_status(
        &self,
        statuses: &[SettlementStatus],
        limit: usize,
    ) -> Result<Vec<SettlementRecord>, X402Error> {
        let mut records: Vec<_> = self
            .settlements
            .iter()
            .filter(|r| statuses.contains(&r.status))
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records.truncate(limit);
        Ok(records)
    }

    fn put_idempotency(&self, entry: &IdempotencyEntry) -> Result<(), X402Error> {
        self.idempotency.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyEntry>, X402Error> {
        Ok(self.idempotency.get(key).map(|e| e.clone()))
    }

    fn purge_expired_idempotency(&self, max_age_secs: u64) -> Result<usize, X402Error> {
        let cutoff = Utc::now().timestamp().saturating_sub(max_age_secs as i64);
        let before = self.idempotency.len();
        self.idempotency
            .retain(|_, e| e.created_at.timestamp() >= cutoff);
        Ok(before - self.idempotency.len())
    }
}
