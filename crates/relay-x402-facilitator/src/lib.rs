//! x402 facilitator server.
//!
//! HTTP front door over the [`x402`] core: verification, fee-split
//! settlement, finality tracking, idempotent request handling and per-IP
//! rate limiting.

pub mod bootstrap;
pub mod metrics;
pub mod routes;
pub mod state;
