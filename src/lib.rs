//! zkpay orchestrator - withdrawal and commitment orchestration
//!
//! Drives checkbooks (committed deposits), their allocations and withdraw
//! requests through proof generation, on-chain submission and payout, with
//! polling-based reconciliation against the chain, retry from failure and
//! multisig gating of privileged actions.

pub mod api;
pub mod chain;
pub mod clients;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod multisig;
pub mod orchestrator;
pub mod polling;
pub mod retry;
pub mod status;
pub mod store;

pub use error::{OrchestratorError, OrchestratorResult};
