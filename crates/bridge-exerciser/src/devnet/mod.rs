//! In-process devnet: a two-chain ledger and a keyring.
//!
//! Lets the exerciser run end to end without external nodes. Real node clients
//! implement the same [`crate::chain`] traits.

mod keyring;
mod ledger;
pub mod wire;

pub use keyring::{Keyring, address_for};
pub use ledger::{DestinationLedger, Faults, LocalLedger, SourceLedger};
