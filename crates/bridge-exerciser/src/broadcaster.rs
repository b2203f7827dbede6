//! Submission of pre-signed transfers under a chosen ordering policy.
//!
//! Each sender's transfers form one lane. Lanes run concurrently; within a
//! lane submissions are strictly sequential. Under random order a transfer can
//! reach the chain before its predecessor and is rejected with a sequence gap.
//! Such a transfer is parked until the predecessor is accepted and then
//! resubmitted after a backoff. Gap retries are bounded per transfer.

use crate::{
    chain::{BroadcastOutcome, DestinationChain, Rejection},
    config::BroadcastOrder,
    error::Error,
    metrics::ExerciserMetrics,
    retry::RetryPolicy,
    types::{Address, SignedTransfer, TransferId, TxHash},
};
use futures::future::join_all;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one planned transfer.
#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub transfer_id: TransferId,
    pub sender: Address,
    pub sequence: u64,
    pub tx_reference: TxHash,
    pub accepted: bool,
    /// Number of times the transfer was handed to the chain.
    pub attempts: u32,
    pub error: Option<Error>,
}

pub struct Broadcaster {
    chain: Arc<dyn DestinationChain>,
    /// `max_retries` bounds the gap retries of a single transfer.
    backoff: RetryPolicy,
    metrics: ExerciserMetrics,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Pending {
    transfer: SignedTransfer,
    attempts: u32,
    gap_retries: u32,
}

impl Pending {
    fn new(transfer: SignedTransfer) -> Self {
        Self {
            transfer,
            attempts: 0,
            gap_retries: 0,
        }
    }

    fn finish(self, accepted: bool, tx_reference: TxHash, error: Option<Error>) -> SubmitResult {
        SubmitResult {
            transfer_id: self.transfer.id(),
            sender: self.transfer.sender().clone(),
            sequence: self.transfer.sequence(),
            tx_reference,
            accepted,
            attempts: self.attempts,
            error,
        }
    }

    fn fail(self, error: Error) -> SubmitResult {
        let tx_reference = self.transfer.tx_hash().clone();
        self.finish(false, tx_reference, Some(error))
    }
}

/// Transfers of one lane not yet handed to the chain.
enum DrawPool {
    Fifo(VecDeque<SignedTransfer>),
    Random {
        items: Vec<SignedTransfer>,
        rng: StdRng,
    },
}

impl DrawPool {
    fn new(mut transfers: Vec<SignedTransfer>, order: BroadcastOrder) -> Self {
        transfers.sort_by_key(SignedTransfer::sequence);
        match order {
            BroadcastOrder::Fifo => Self::Fifo(transfers.into()),
            BroadcastOrder::Random { seed } => Self::Random {
                items: transfers,
                rng: StdRng::seed_from_u64(seed),
            },
        }
    }

    fn draw(&mut self) -> Option<SignedTransfer> {
        match self {
            Self::Fifo(queue) => queue.pop_front(),
            Self::Random { items, rng } => {
                if items.is_empty() {
                    None
                } else {
                    let index = rng.gen_range(0..items.len());
                    Some(items.swap_remove(index))
                }
            }
        }
    }

    fn contains(&self, sequence: u64) -> bool {
        match self {
            Self::Fifo(queue) => queue.iter().any(|t| t.sequence() == sequence),
            Self::Random { items, .. } => items.iter().any(|t| t.sequence() == sequence),
        }
    }

    fn drain(&mut self) -> Vec<SignedTransfer> {
        match self {
            Self::Fifo(queue) => queue.drain(..).collect(),
            Self::Random { items, .. } => std::mem::take(items),
        }
    }
}

/// Per-lane bookkeeping.
struct Lane {
    pool: DrawPool,
    /// Transfers waiting for their predecessor, keyed by sequence.
    parked: BTreeMap<u64, Pending>,
    /// Transfers to submit before drawing from the pool.
    ready: VecDeque<Pending>,
    failed: BTreeSet<u64>,
    results: Vec<SubmitResult>,
}

impl Lane {
    fn next(&mut self) -> Option<Pending> {
        self.ready
            .pop_front()
            .or_else(|| self.pool.draw().map(Pending::new))
            .or_else(|| self.parked.pop_first().map(|(_, pending)| pending))
    }

    fn is_outstanding(&self, sequence: u64) -> bool {
        self.pool.contains(sequence)
            || self.parked.contains_key(&sequence)
            || self.ready.iter().any(|p| p.transfer.sequence() == sequence)
    }

    /// Moves the successor of `sequence` out of the parking lot.
    fn release_successor(&mut self, sequence: u64) {
        if let Some(successor) = self.parked.remove(&(sequence + 1)) {
            self.ready.push_back(successor);
        }
    }

    fn cancel_remaining(&mut self, current: Pending) {
        self.results.push(current.fail(Error::Cancelled));
        let remaining: Vec<Pending> = self
            .ready
            .drain(..)
            .chain(self.pool.drain().into_iter().map(Pending::new))
            .chain(std::mem::take(&mut self.parked).into_values())
            .collect();
        for pending in remaining {
            self.results.push(pending.fail(Error::Cancelled));
        }
    }
}

impl Broadcaster {
    pub fn new(
        chain: Arc<dyn DestinationChain>,
        backoff: RetryPolicy,
        metrics: ExerciserMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            chain,
            backoff,
            metrics,
            cancel,
        }
    }

    /// Submits every transfer in `queue` and reports one result per transfer.
    ///
    /// Transfers are grouped by sender. Under [`BroadcastOrder::Random`] each
    /// sender's lane draws from its own generator seeded with `seed` as given;
    /// callers pick per-sender seeds with [`BroadcastOrder::for_sender`].
    pub async fn submit_all(
        &self,
        queue: Vec<SignedTransfer>,
        order: BroadcastOrder,
    ) -> Vec<SubmitResult> {
        let mut lanes: BTreeMap<Address, Vec<SignedTransfer>> = BTreeMap::new();
        for transfer in queue {
            lanes.entry(transfer.sender().clone()).or_default().push(transfer);
        }

        let submissions = lanes
            .into_values()
            .map(|transfers| self.submit_lane(transfers, order));

        join_all(submissions).await.into_iter().flatten().collect()
    }

    async fn submit_lane(
        &self,
        transfers: Vec<SignedTransfer>,
        order: BroadcastOrder,
    ) -> Vec<SubmitResult> {
        let total = transfers.len();
        let mut lane = Lane {
            pool: DrawPool::new(transfers, order),
            parked: BTreeMap::new(),
            ready: VecDeque::new(),
            failed: BTreeSet::new(),
            results: Vec::with_capacity(total),
        };

        while let Some(mut pending) = lane.next() {
            if self.cancel.is_cancelled() {
                lane.cancel_remaining(pending);
                break;
            }

            if pending.gap_retries > 0 {
                let delay = self.backoff.delay_for(pending.gap_retries - 1);
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        lane.cancel_remaining(pending);
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let sequence = pending.transfer.sequence();
            pending.attempts += 1;
            match self.submit_once(&pending.transfer).await {
                Ok(tx_hash) => {
                    self.metrics.record_accepted();
                    lane.results.push(pending.finish(true, tx_hash, None));
                    lane.release_successor(sequence);
                }
                Err(Error::SequenceGap { expected, .. }) => {
                    pending.gap_retries += 1;
                    self.metrics.record_gap_retry();

                    let stuck_on = lane.failed.range(expected..sequence).next().copied();
                    if let Some(failed) = stuck_on {
                        self.fail(&mut lane, pending, format!("predecessor {failed} failed"));
                    } else if pending.gap_retries > self.backoff.max_retries {
                        let reason = format!(
                            "sequence gap unresolved after {} retries, chain expects {expected}",
                            self.backoff.max_retries
                        );
                        self.fail(&mut lane, pending, reason);
                    } else if lane.is_outstanding(sequence - 1) {
                        debug!(
                            sender = %pending.transfer.sender(),
                            sequence,
                            expected,
                            "Parking until predecessor is accepted"
                        );
                        lane.parked.insert(sequence, pending);
                    } else {
                        lane.ready.push_front(pending);
                    }
                }
                Err(Error::Submission { reason, .. }) => self.fail(&mut lane, pending, reason),
                Err(err) => {
                    let reason = err.to_string();
                    self.fail(&mut lane, pending, reason);
                }
            }
        }

        let accepted = lane.results.iter().filter(|r| r.accepted).count();
        info!(total, accepted, "Lane finished");
        lane.results
    }

    /// Hands one transfer to the chain. Gaps come back as [`Error::SequenceGap`].
    async fn submit_once(&self, transfer: &SignedTransfer) -> Result<TxHash, Error> {
        let sender = transfer.sender();
        let sequence = transfer.sequence();
        self.metrics.record_submitted();

        let started = tokio::time::Instant::now();
        let outcome = self.chain.broadcast(transfer.encoded()).await;
        self.metrics
            .record_submit_latency(started.elapsed().as_secs_f64());

        match outcome {
            Ok(BroadcastOutcome::Accepted { tx_hash }) => {
                debug!(%sender, sequence, %tx_hash, "Accepted");
                Ok(tx_hash)
            }
            Ok(BroadcastOutcome::Rejected(Rejection::SequenceMismatch { expected, got }))
                if expected < got =>
            {
                debug!(%sender, sequence, expected, "Sequence gap");
                Err(Error::SequenceGap {
                    address: sender.clone(),
                    sequence,
                    expected,
                })
            }
            Ok(BroadcastOutcome::Rejected(Rejection::SequenceMismatch { expected, .. })) => {
                Err(Error::Submission {
                    address: sender.clone(),
                    sequence,
                    reason: format!("sequence already committed, chain expects {expected}"),
                })
            }
            Ok(BroadcastOutcome::Rejected(rejection)) => Err(Error::Submission {
                address: sender.clone(),
                sequence,
                reason: rejection.to_string(),
            }),
            Err(err) => Err(Error::Submission {
                address: sender.clone(),
                sequence,
                reason: err.to_string(),
            }),
        }
    }

    fn fail(&self, lane: &mut Lane, pending: Pending, reason: String) {
        let sender = pending.transfer.sender().clone();
        let sequence = pending.transfer.sequence();
        warn!(%sender, sequence, %reason, "Transfer failed");
        self.metrics.record_failed();

        lane.failed.insert(sequence);
        lane.release_successor(sequence);
        lane.results.push(pending.fail(Error::Submission {
            address: sender,
            sequence,
            reason,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::Faucet,
        config::ExerciserConfig,
        devnet::{Keyring, LocalLedger},
        factory::TransactionFactory,
        sequencer::AccountSequencer,
        types::{ChainSide, Denom, TransferKind, TransferRequest},
    };
    use std::time::Duration;

    struct Harness {
        ledger: LocalLedger,
        keyring: Arc<Keyring>,
        chain: Arc<dyn DestinationChain>,
    }

    impl Harness {
        fn new() -> Self {
            let ledger = LocalLedger::new(&ExerciserConfig::default_test_config());
            let chain: Arc<dyn DestinationChain> = Arc::new(ledger.destination());
            Self {
                ledger,
                keyring: Arc::new(Keyring::new("dst1")),
                chain,
            }
        }

        /// Funds `label` and signs `count` burns from it with sequences `0..count`.
        async fn batch(&self, label: &str, count: u64) -> (Address, Vec<SignedTransfer>) {
            let sender = self.keyring.derive(label);
            self.ledger
                .fund(
                    ChainSide::Destination,
                    &sender,
                    &[(Denom::from("ceth"), 1_000_000), (Denom::from("rowan"), 1_000_000_000)],
                )
                .await
                .unwrap();

            let mut sequencer =
                AccountSequencer::new(self.chain.clone(), true, RetryPolicy::default());
            sequencer.current(&sender).await.unwrap();
            let factory = TransactionFactory::new(
                self.chain.clone(),
                self.keyring.clone(),
                ExerciserMetrics::default(),
            );

            let mut batch = Vec::new();
            for ordinal in 0..count {
                let request = TransferRequest {
                    id: TransferId {
                        sender: 0,
                        receiver: 0,
                        ordinal,
                    },
                    from: sender.clone(),
                    to: Address::from("0xreceiver"),
                    amount: 10,
                    denom: Denom::from("ceth"),
                    kind: TransferKind::Burn,
                };
                batch.push(factory.build_and_sign(&mut sequencer, &request).await.unwrap());
            }
            (sender, batch)
        }

        fn broadcaster(&self, max_gap_retries: u32, cancel: CancellationToken) -> Broadcaster {
            Broadcaster::new(
                self.chain.clone(),
                RetryPolicy::new(max_gap_retries, Duration::from_millis(100), Duration::from_secs(5)),
                ExerciserMetrics::default(),
                cancel,
            )
        }

        async fn sequence_of(&self, account: &Address) -> u64 {
            self.chain.query_account(account).await.unwrap().sequence
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_submits_in_order_without_retries() {
        let h = Harness::new();
        let (sender, batch) = h.batch("alice", 5).await;

        let results = h
            .broadcaster(8, CancellationToken::new())
            .submit_all(batch, BroadcastOrder::Fifo)
            .await;

        let sequences: Vec<u64> = results.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert!(results.iter().all(|r| r.accepted && r.attempts == 1 && r.error.is_none()));
        assert_eq!(h.sequence_of(&sender).await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_order_resolves_gaps() {
        let h = Harness::new();
        let (sender, batch) = h.batch("alice", 20).await;

        let results = h
            .broadcaster(8, CancellationToken::new())
            .submit_all(batch, BroadcastOrder::Random { seed: 7 })
            .await;

        assert_eq!(results.len(), 20);
        assert!(results.iter().all(|r| r.accepted), "{results:?}");
        assert_eq!(h.sequence_of(&sender).await, 20);

        // Acceptance order is ascending sequence within the lane.
        let accepted: Vec<u64> = results.iter().map(|r| r.sequence).collect();
        assert_eq!(accepted, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_random_pool_draws_with_given_seed() {
        let h = Harness::new();
        let (_, batch) = h.batch("alice", 8).await;

        let mut pool = DrawPool::new(batch, BroadcastOrder::Random { seed: 11 });
        let drawn: Vec<u64> = std::iter::from_fn(|| pool.draw()).map(|t| t.sequence()).collect();

        let mut rng = StdRng::seed_from_u64(11);
        let mut remaining: Vec<u64> = (0..8).collect();
        let mut expected = Vec::new();
        while !remaining.is_empty() {
            let index = rng.gen_range(0..remaining.len());
            expected.push(remaining.swap_remove(index));
        }
        assert_eq!(drawn, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_and_random_reach_same_balances() {
        let fifo = Harness::new();
        let (fifo_sender, fifo_batch) = fifo.batch("alice", 12).await;
        fifo.broadcaster(8, CancellationToken::new())
            .submit_all(fifo_batch, BroadcastOrder::Fifo)
            .await;

        let random = Harness::new();
        let (random_sender, random_batch) = random.batch("alice", 12).await;
        random
            .broadcaster(8, CancellationToken::new())
            .submit_all(random_batch, BroadcastOrder::Random { seed: 99 })
            .await;

        assert_eq!(fifo_sender, random_sender);
        for denom in ["ceth", "rowan"] {
            let denom = Denom::from(denom);
            assert_eq!(
                fifo.chain.get_balance(&fifo_sender, &denom).await.unwrap(),
                random.chain.get_balance(&random_sender, &denom).await.unwrap()
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lanes_run_independently() {
        let h = Harness::new();
        let (alice, mut batch) = h.batch("alice", 4).await;
        let (bob, bob_batch) = h.batch("bob", 3).await;
        batch.extend(bob_batch);

        let results = h
            .broadcaster(8, CancellationToken::new())
            .submit_all(batch, BroadcastOrder::Random { seed: 1 })
            .await;

        assert_eq!(results.len(), 7);
        assert!(results.iter().all(|r| r.accepted));
        assert_eq!(h.sequence_of(&alice).await, 4);
        assert_eq!(h.sequence_of(&bob).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_predecessor_escalates_after_bounded_retries() {
        let h = Harness::new();
        let (sender, mut batch) = h.batch("alice", 3).await;
        batch.remove(0);

        let results = h
            .broadcaster(2, CancellationToken::new())
            .submit_all(batch, BroadcastOrder::Fifo)
            .await;

        assert_eq!(results.len(), 2);
        let first = results.iter().find(|r| r.sequence == 1).unwrap();
        assert!(!first.accepted);
        assert_eq!(first.attempts, 3);
        assert!(matches!(first.error, Some(Error::Submission { .. })));
        // The successor escalates as soon as its predecessor has failed.
        let second = results.iter().find(|r| r.sequence == 2).unwrap();
        assert!(!second.accepted);
        assert_eq!(second.attempts, 1);
        assert_eq!(h.sequence_of(&sender).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_transfer_is_fatal() {
        let h = Harness::new();
        let (sender, batch) = h.batch("alice", 2).await;
        let replay = vec![batch[0].clone()];

        let results = h
            .broadcaster(8, CancellationToken::new())
            .submit_all(batch, BroadcastOrder::Fifo)
            .await;
        assert!(results.iter().all(|r| r.accepted));

        // A sequence the chain has already committed is not a gap.
        let results = h
            .broadcaster(8, CancellationToken::new())
            .submit_all(replay, BroadcastOrder::Fifo)
            .await;
        assert_eq!(results[0].attempts, 1);
        assert!(matches!(
            &results[0].error,
            Some(Error::Submission { reason, .. }) if reason.contains("already committed")
        ));
        assert_eq!(h.sequence_of(&sender).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_submission() {
        let h = Harness::new();
        let (sender, batch) = h.batch("alice", 4).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = h
            .broadcaster(8, cancel)
            .submit_all(batch, BroadcastOrder::Fifo)
            .await;

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| matches!(r.error, Some(Error::Cancelled))));
        assert_eq!(h.sequence_of(&sender).await, 0);
    }
}
