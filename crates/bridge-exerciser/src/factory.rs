//! Offline generation of signed, encoded transfers.

use crate::{
    chain::{ChainError, DestinationChain, TransferSigner},
    error::{Error, Result},
    metrics::ExerciserMetrics,
    plan::TransferPlan,
    sequencer::AccountSequencer,
    types::{SignContext, SignedTransfer, SignedTx, TransferRequest},
};
use std::{sync::Arc, time::Instant};
use tracing::{debug, info};

pub struct TransactionFactory {
    chain: Arc<dyn DestinationChain>,
    signer: Arc<dyn TransferSigner>,
    metrics: ExerciserMetrics,
}

impl std::fmt::Debug for TransactionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionFactory")
            .field("chain_id", &self.chain.chain_id())
            .finish_non_exhaustive()
    }
}

impl TransactionFactory {
    pub fn new(
        chain: Arc<dyn DestinationChain>,
        signer: Arc<dyn TransferSigner>,
        metrics: ExerciserMetrics,
    ) -> Self {
        Self {
            chain,
            signer,
            metrics,
        }
    }

    /// Builds, sequences, signs and encodes one transfer.
    ///
    /// The sequence is reserved under the request's [`TransferId`](crate::types::TransferId),
    /// so regenerating the same request yields the same bytes.
    pub async fn build_and_sign(
        &self,
        sequencer: &mut AccountSequencer,
        request: &TransferRequest,
    ) -> Result<SignedTransfer> {
        let invalid = |reason: String| Error::InvalidAmount {
            amount: request.amount,
            denom: request.denom.clone(),
            reason,
        };
        if request.amount == 0 {
            return Err(invalid("amount must be positive".into()));
        }
        let unsigned = self
            .chain
            .build_transfer(request.kind, &request.from, &request.to, request.amount, &request.denom)
            .map_err(|e| match e {
                ChainError::UnknownDenom(_) => invalid(e.to_string()),
                other => invalid(format!("cannot build transfer: {other}")),
            })?;

        let sequence = sequencer.reserve_for(&request.from, request.id)?;
        let account_number = sequencer
            .account_number(&request.from)
            .ok_or_else(|| Error::AccountQuery {
                address: request.from.clone(),
                source: ChainError::UnknownAccount(request.from.clone()),
            })?;
        let context = SignContext {
            chain_id: self.chain.chain_id().to_string(),
            account_number,
            sequence,
        };

        let signing_error = |source| Error::Signing {
            address: request.from.clone(),
            source,
        };
        let sign_bytes = self
            .chain
            .sign_bytes(&unsigned, &context)
            .map_err(signing_error)?;
        let signature = self
            .signer
            .sign(&request.from, &sign_bytes)
            .await
            .map_err(signing_error)?;

        let tx = SignedTx {
            unsigned,
            context,
            signature,
        };
        let encoded = self.chain.encode(&tx).map_err(|source| Error::Encoding {
            address: request.from.clone(),
            sequence,
            source,
        })?;

        let transfer = SignedTransfer::new(request.id, tx, encoded);
        self.metrics.record_generated();
        debug!(
            from = %request.from,
            to = %request.to,
            sequence,
            tx_hash = %transfer.tx_hash(),
            "Generated transfer"
        );
        Ok(transfer)
    }

    /// Generates every transfer of `sender` in `plan`, in generation order.
    ///
    /// The sender's account must already be loaded into `sequencer`.
    pub async fn build_batch(
        &self,
        sequencer: &mut AccountSequencer,
        plan: &TransferPlan,
        sender: usize,
    ) -> Result<Vec<SignedTransfer>> {
        let started = Instant::now();
        let mut batch = Vec::new();
        for request in plan.transfers_for(sender) {
            batch.push(self.build_and_sign(sequencer, &request).await?);
        }

        let elapsed = started.elapsed();
        info!(
            sender = %plan.senders()[sender],
            count = batch.len(),
            elapsed_ms = %elapsed.as_millis(),
            rate_per_sec = %format!("{:.1}", rate(batch.len(), elapsed)),
            "Generated batch"
        );
        Ok(batch)
    }
}

pub(crate) fn rate(count: usize, elapsed: std::time::Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}
