//! JSON wire format of the devnet destination chain.

use crate::{
    chain::ChainError,
    types::{SignContext, SignedTx, TransferSignature, UnsignedTransfer},
};
use serde::{Deserialize, Serialize};

/// Document a signer commits to. Field order is fixed by the struct, so the
/// serialization is canonical.
#[derive(Debug, Serialize)]
struct SignDoc<'a> {
    chain_id: &'a str,
    account_number: u64,
    sequence: u64,
    body: &'a UnsignedTransfer,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthInfo {
    sequence: u64,
    account_number: u64,
    public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireTx {
    chain_id: String,
    body: UnsignedTransfer,
    auth: AuthInfo,
    signature: String,
}

pub(crate) fn sign_bytes(
    unsigned: &UnsignedTransfer,
    context: &SignContext,
) -> Result<Vec<u8>, ChainError> {
    serde_json::to_vec(&SignDoc {
        chain_id: &context.chain_id,
        account_number: context.account_number,
        sequence: context.sequence,
        body: unsigned,
    })
    .map_err(|e| ChainError::Malformed(e.to_string()))
}

pub(crate) fn encode(tx: &SignedTx) -> Result<Vec<u8>, ChainError> {
    let wire = WireTx {
        chain_id: tx.context.chain_id.clone(),
        body: tx.unsigned.clone(),
        auth: AuthInfo {
            sequence: tx.context.sequence,
            account_number: tx.context.account_number,
            public_key: hex::encode(&tx.signature.public_key),
        },
        signature: hex::encode(&tx.signature.signature),
    };
    serde_json::to_vec(&wire).map_err(|e| ChainError::Malformed(e.to_string()))
}

pub fn decode(tx_bytes: &[u8]) -> Result<SignedTx, ChainError> {
    let wire: WireTx =
        serde_json::from_slice(tx_bytes).map_err(|e| ChainError::Malformed(e.to_string()))?;
    let public_key = hex::decode(&wire.auth.public_key)
        .map_err(|e| ChainError::Malformed(format!("public key: {e}")))?;
    let signature = hex::decode(&wire.signature)
        .map_err(|e| ChainError::Malformed(format!("signature: {e}")))?;

    Ok(SignedTx {
        unsigned: wire.body,
        context: SignContext {
            chain_id: wire.chain_id,
            account_number: wire.auth.account_number,
            sequence: wire.auth.sequence,
        },
        signature: TransferSignature {
            public_key,
            signature,
        },
    })
}
