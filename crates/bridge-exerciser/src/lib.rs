//! Load and correctness exerciser for a two-chain token bridge.
//!
//! Generates signed transfers offline with locally tracked account
//! sequences, broadcasts them in FIFO or shuffled order, and reconciles
//! every touched balance on both chains against an exact prediction.
//!
//! Chains are reached through the traits in [`chain`]. The [`devnet`] module
//! provides an in-process ledger implementing both sides.

pub mod broadcaster;
pub mod chain;
pub mod config;
pub mod devnet;
pub mod error;
pub mod factory;
pub mod fees;
pub mod metrics;
pub mod plan;
pub mod retry;
pub mod runner;
pub mod sequencer;
pub mod types;
pub mod watcher;

#[cfg(test)]
mod tests;

pub use config::ExerciserConfig;
pub use error::{Error, Result};
pub use plan::TransferPlan;
pub use runner::{LockLeg, ReconciliationReport, ScenarioContext, ScenarioRunner};
