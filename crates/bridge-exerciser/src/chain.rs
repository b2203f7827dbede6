//! Collaborator interfaces to the two chains, the signer and the faucet.
//!
//! The engine only talks to chains through these traits. [`crate::devnet`] ships an
//! in-process implementation; real node clients implement the same traits.

use crate::types::{
    AccountInfo, Address, Amount, ChainSide, Denom, SignContext, SignedTx, TransferKind,
    TransferSignature, TxHash, UnsignedTransfer,
};
use async_trait::async_trait;
use std::fmt;

/// Errors reported by chain clients and other collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("account {0} not found")]
    UnknownAccount(Address),

    #[error("unknown denom {0}")]
    UnknownDenom(Denom),

    #[error("no signing key for {0}")]
    MissingKey(Address),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

impl ChainError {
    /// Transport failures are the only errors worth retrying at this layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Why the destination chain refused a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The account's committed sequence differs from the submitted one.
    SequenceMismatch { expected: u64, got: u64 },
    InsufficientFunds { denom: Denom, needed: Amount, available: Amount },
    Other { code: u32, log: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SequenceMismatch { expected, got } => {
                write!(f, "account sequence mismatch, expected {expected}, got {got}")
            }
            Self::InsufficientFunds {
                denom,
                needed,
                available,
            } => write!(f, "insufficient funds: need {needed}{denom}, have {available}{denom}"),
            Self::Other { code, log } => write!(f, "code {code}: {log}"),
        }
    }
}

/// Result of handing encoded bytes to the destination chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Accepted { tx_hash: TxHash },
    Rejected(Rejection),
}

/// Acknowledgement of a source-chain lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockReceipt {
    pub tx_hash: TxHash,
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    pub denom: Denom,
}

/// Read access to balances, shared by both chains.
#[async_trait]
pub trait BalanceQuery: Send + Sync {
    /// Balance of `account` in `denom`. Unknown accounts report zero.
    async fn get_balance(&self, account: &Address, denom: &Denom) -> Result<Amount, ChainError>;
}

/// Chain holding the native asset.
#[async_trait]
pub trait SourceChain: BalanceQuery {
    /// Locks `amount` of the native `denom`, to be minted to `to` on the destination chain.
    async fn lock(
        &self,
        from: &Address,
        to: &Address,
        amount: Amount,
        denom: &Denom,
    ) -> Result<LockReceipt, ChainError>;

    /// Moves the chain forward far enough for pending bridge events to be relayed.
    async fn advance_time_or_blocks(&self) -> Result<(), ChainError>;
}

/// Chain holding the wrapped asset, where transfers are generated and broadcast.
#[async_trait]
pub trait DestinationChain: BalanceQuery {
    fn chain_id(&self) -> &str;

    async fn query_account(&self, address: &Address) -> Result<AccountInfo, ChainError>;

    /// Builds the message body. Fails for denoms the chain does not know.
    fn build_transfer(
        &self,
        kind: TransferKind,
        from: &Address,
        to: &Address,
        amount: Amount,
        denom: &Denom,
    ) -> Result<UnsignedTransfer, ChainError>;

    /// Canonical bytes a signer commits to.
    fn sign_bytes(
        &self,
        unsigned: &UnsignedTransfer,
        context: &SignContext,
    ) -> Result<Vec<u8>, ChainError>;

    fn encode(&self, tx: &SignedTx) -> Result<Vec<u8>, ChainError>;

    async fn broadcast(&self, tx_bytes: &[u8]) -> Result<BroadcastOutcome, ChainError>;
}

/// Holds key material and produces signatures over sign bytes.
#[async_trait]
pub trait TransferSigner: Send + Sync {
    async fn sign(
        &self,
        signer: &Address,
        sign_bytes: &[u8],
    ) -> Result<TransferSignature, ChainError>;
}

/// Creates and funds accounts before a run.
#[async_trait]
pub trait Faucet: Send + Sync {
    async fn fund(
        &self,
        side: ChainSide,
        address: &Address,
        amounts: &[(Denom, Amount)],
    ) -> Result<(), ChainError>;
}
