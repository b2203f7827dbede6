//! Value types shared by the sequencing and verification engine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Token amount in the asset's smallest indivisible unit.
pub type Amount = u128;

/// Signed balance change.
pub type SignedAmount = i128;

/// Chain-agnostic account address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Asset identifier, e.g. `rowan` or `ceth`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Denom(String);

impl Denom {
    pub fn new(denom: impl Into<String>) -> Self {
        Self(denom.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Denom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Denom {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Which side of the bridge an account or balance lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainSide {
    /// Chain holding the native asset (lock / release).
    Source,
    /// Chain holding the wrapped asset (mint / burn).
    Destination,
}

impl fmt::Display for ChainSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Destination => f.write_str("destination"),
        }
    }
}

/// What a destination-chain transfer does with the value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Burn the wrapped asset and release the native asset to a source-chain receiver.
    #[default]
    Burn,
    /// Plain bank send between two destination-chain accounts.
    Send,
}

/// On-chain account state relevant to replay protection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub address: Address,
    pub sequence: u64,
    pub account_number: u64,
}

/// Identifies one logical transfer of a plan: its matrix cell and ordinal within the cell.
///
/// Retrying the same logical transfer reuses the same id, which keeps sequence
/// reservation idempotent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransferId {
    pub sender: usize,
    pub receiver: usize,
    pub ordinal: u64,
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.sender, self.receiver, self.ordinal)
    }
}

/// Everything needed to generate one transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub id: TransferId,
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    pub denom: Denom,
    pub kind: TransferKind,
}

/// Transfer body before sequence assignment and signing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransfer {
    pub kind: TransferKind,
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    pub denom: Denom,
}

/// Replay-protection context bound into a signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignContext {
    pub chain_id: String,
    pub account_number: u64,
    pub sequence: u64,
}

/// Output of the signer collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferSignature {
    /// SEC1-encoded public key of the signer.
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// A signed transfer that has not been encoded for the wire yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTx {
    pub unsigned: UnsignedTransfer,
    pub context: SignContext,
    pub signature: TransferSignature,
}

/// Hex-encoded SHA-256 of the wire bytes, as reported by the chain.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    pub fn of(tx_bytes: &[u8]) -> Self {
        Self(hex::encode_upper(Sha256::digest(tx_bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully generated transfer, ready for broadcast.
///
/// Created exactly once per planned transfer and never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTransfer {
    id: TransferId,
    tx: SignedTx,
    encoded: Vec<u8>,
    tx_hash: TxHash,
}

impl SignedTransfer {
    pub fn new(id: TransferId, tx: SignedTx, encoded: Vec<u8>) -> Self {
        let tx_hash = TxHash::of(&encoded);
        Self {
            id,
            tx,
            encoded,
            tx_hash,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn unsigned(&self) -> &UnsignedTransfer {
        &self.tx.unsigned
    }

    pub fn sender(&self) -> &Address {
        &self.tx.unsigned.from
    }

    pub fn sequence(&self) -> u64 {
        self.tx.context.sequence
    }

    pub fn account_number(&self) -> u64 {
        self.tx.context.account_number
    }

    pub fn signature(&self) -> &TransferSignature {
        &self.tx.signature
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn tx_hash(&self) -> &TxHash {
        &self.tx_hash
    }
}

/// Point-in-time balance read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub account: Address,
    pub denom: Denom,
    pub amount: Amount,
    pub taken_at: tokio::time::Instant,
}

/// `sample - baseline` without overflow for any `u128` pair that fits in `i128`.
pub fn balance_delta(baseline: Amount, sample: Amount) -> SignedAmount {
    if sample >= baseline {
        SignedAmount::try_from(sample - baseline).unwrap_or(SignedAmount::MAX)
    } else {
        SignedAmount::try_from(baseline - sample)
            .map(|d| -d)
            .unwrap_or(SignedAmount::MIN)
    }
}

/// Serializes a [`std::time::Duration`] as whole milliseconds.
pub(crate) mod serde_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }
}
