use thiserror::Error;

/// Errors returned by facilitator operations.
///
/// Verification failures (expired window, reused nonce, insufficient
/// balance, ...) are NOT errors; they are normal outcomes carried in
/// [`crate::VerificationResult`]. This enum covers input errors rejected
/// before any I/O, settlement faults, and infrastructure faults.
#[derive(Debug, Error)]
pub enum X402Error {
    /// The payment header could not be decoded into a known authorization
    /// shape (bad base64, bad JSON, unrecognized fields, missing from/nonce).
    #[error("malformed authorization: {0}")]
    MalformedAuthorization(String),

    /// The signature component had the wrong length or encoding.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// The ledger RPC failed or was unreachable. Retriable.
    #[error("ledger error: {0}")]
    LedgerError(String),

    /// The ledger refused the submission (revert, replay guard, simulation).
    #[error("ledger rejected: {0}")]
    LedgerRejected(String),

    /// The durable store failed. Retriable.
    #[error("store error: {0}")]
    StoreError(String),

    /// The primary settlement transfer failed before anything was persisted.
    /// Safe to retry from scratch with a fresh authorization.
    #[error("settlement failed: {0}")]
    SettlementFailed(String),

    /// The same idempotency key was presented with a different request body.
    #[error("idempotency key conflict: key {0} was already used with a different request")]
    IdempotencyKeyConflict(String),

    /// Per-identity request ceiling reached for the current minute window.
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimitExceeded { retry_after: u64 },

    /// A ledger call exceeded its deadline. The underlying transfer may
    /// still have landed; callers must re-query by transaction hash rather
    /// than resubmit.
    #[error("timed out waiting for {0}; outcome unknown, re-query by transaction hash")]
    Timeout(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
