use crate::{
    chain::ChainError,
    runner::ReconciliationReport,
    types::{Address, Amount, Denom, SignedAmount},
};
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("failed to query account {address}: {source}")]
    AccountQuery {
        address: Address,
        #[source]
        source: ChainError,
    },

    #[error("sender {address} is not fresh: sequence {sequence}, expected 0")]
    Precondition { address: Address, sequence: u64 },

    #[error("invalid amount {amount}{denom}: {reason}")]
    InvalidAmount {
        amount: Amount,
        denom: Denom,
        reason: String,
    },

    #[error("failed to sign for {address}: {source}")]
    Signing {
        address: Address,
        #[source]
        source: ChainError,
    },

    #[error("failed to encode tx {address}/{sequence}: {source}")]
    Encoding {
        address: Address,
        sequence: u64,
        #[source]
        source: ChainError,
    },

    #[error("submission of {address}/{sequence} failed: {reason}")]
    Submission {
        address: Address,
        sequence: u64,
        reason: String,
    },

    #[error("sequence gap for {address}: submitted {sequence}, chain expects {expected}")]
    SequenceGap {
        address: Address,
        sequence: u64,
        expected: u64,
    },

    #[error(
        "timed out after {timeout:?} waiting for {address} {denom} delta {expected}, last observed {observed:?}"
    )]
    Timeout {
        address: Address,
        denom: Denom,
        expected: SignedAmount,
        observed: Option<SignedAmount>,
        timeout: Duration,
    },

    #[error("{address} {denom} overshot: expected delta {expected}, observed {observed}")]
    Overshoot {
        address: Address,
        denom: Denom,
        expected: SignedAmount,
        observed: SignedAmount,
    },

    #[error("reconciliation failed: {}", .0.summary())]
    Reconciliation(Box<ReconciliationReport>),

    #[error("failed to fund {address}: {source}")]
    Funding {
        address: Address,
        #[source]
        source: ChainError,
    },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}
