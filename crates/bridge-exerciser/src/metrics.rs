//! Metrics for the exerciser. Recorded through the `metrics` facade; installing
//! an exporter is left to the embedding binary.

use metrics::{Counter, Histogram, counter, histogram};

#[derive(Clone)]
pub struct ExerciserMetrics {
    /// Transactions built, signed and encoded
    pub txs_generated: Counter,

    /// Broadcast attempts, including resubmissions
    pub txs_submitted: Counter,

    /// Transactions accepted by the destination chain
    pub txs_accepted: Counter,

    /// Transactions that failed permanently
    pub txs_failed: Counter,

    /// Resubmissions caused by a sequence gap
    pub sequence_gap_retries: Counter,

    /// Balance samples taken by watchers
    pub balance_polls: Counter,

    /// Broadcast round-trip latency in seconds
    pub submit_latency_seconds: Histogram,
}

impl Default for ExerciserMetrics {
    fn default() -> Self {
        Self {
            txs_generated: counter!("bridge_exerciser_txs_generated"),
            txs_submitted: counter!("bridge_exerciser_txs_submitted"),
            txs_accepted: counter!("bridge_exerciser_txs_accepted"),
            txs_failed: counter!("bridge_exerciser_txs_failed"),
            sequence_gap_retries: counter!("bridge_exerciser_sequence_gap_retries"),
            balance_polls: counter!("bridge_exerciser_balance_polls"),
            submit_latency_seconds: histogram!("bridge_exerciser_submit_latency_seconds"),
        }
    }
}

impl std::fmt::Debug for ExerciserMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExerciserMetrics").finish_non_exhaustive()
    }
}

impl ExerciserMetrics {
    #[inline]
    pub fn record_generated(&self) {
        self.txs_generated.increment(1);
    }

    #[inline]
    pub fn record_submitted(&self) {
        self.txs_submitted.increment(1);
    }

    #[inline]
    pub fn record_accepted(&self) {
        self.txs_accepted.increment(1);
    }

    #[inline]
    pub fn record_failed(&self) {
        self.txs_failed.increment(1);
    }

    #[inline]
    pub fn record_gap_retry(&self) {
        self.sequence_gap_retries.increment(1);
    }

    #[inline]
    pub fn record_balance_poll(&self) {
        self.balance_polls.increment(1);
    }

    /// Record broadcast latency
    #[inline]
    pub fn record_submit_latency(&self, duration_secs: f64) {
        self.submit_latency_seconds.record(duration_secs);
    }
}
