//! Polls a balance until it has moved by exactly the expected amount.

use crate::{
    chain::BalanceQuery,
    error::{Error, Result},
    metrics::ExerciserMetrics,
    types::{Address, Amount, BalanceSnapshot, Denom, SignedAmount, balance_delta},
};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// What to wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    pub account: Address,
    pub denom: Denom,
    pub baseline: Amount,
    pub expected_delta: SignedAmount,
    /// Fail as soon as a sample moves past `expected_delta`. Only meaningful for
    /// balances that move in one direction during the run.
    pub detect_overshoot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub timeout: Duration,
}

/// A successful observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedDelta {
    pub account: Address,
    pub denom: Denom,
    pub baseline: Amount,
    pub final_amount: Amount,
    pub delta: SignedAmount,
    pub polls: u32,
    #[serde(with = "crate::types::serde_millis")]
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct BalanceWatcher {
    cancel: CancellationToken,
    metrics: ExerciserMetrics,
}

impl BalanceWatcher {
    pub fn new(cancel: CancellationToken, metrics: ExerciserMetrics) -> Self {
        Self { cancel, metrics }
    }

    /// Reads one balance.
    pub async fn snapshot(
        &self,
        chain: &dyn BalanceQuery,
        account: &Address,
        denom: &Denom,
    ) -> Result<BalanceSnapshot> {
        self.metrics.record_balance_poll();
        let amount = chain
            .get_balance(account, denom)
            .await
            .map_err(|source| Error::AccountQuery {
                address: account.clone(),
                source,
            })?;
        Ok(BalanceSnapshot {
            account: account.clone(),
            denom: denom.clone(),
            amount,
            taken_at: Instant::now(),
        })
    }

    /// Samples every `schedule.interval` until `sample - baseline == expected_delta`.
    ///
    /// Fails with [`Error::Timeout`] once `schedule.timeout` has elapsed, and
    /// with [`Error::Overshoot`] if overshoot detection is on and a sample
    /// moves past the expectation. Transient read failures are retried on the
    /// next poll.
    pub async fn await_delta(
        &self,
        chain: &dyn BalanceQuery,
        request: &WatchRequest,
        schedule: PollSchedule,
    ) -> Result<ObservedDelta> {
        let WatchRequest {
            account,
            denom,
            baseline,
            expected_delta,
            detect_overshoot,
        } = request;
        let started = Instant::now();
        let deadline = started + schedule.timeout;
        let mut polls = 0u32;
        let mut last_delta = None;

        loop {
            polls += 1;
            match self.snapshot(chain, account, denom).await {
                Ok(sample) => {
                    let delta = balance_delta(*baseline, sample.amount);
                    last_delta = Some(delta);
                    trace!(%account, %denom, delta, expected = expected_delta, "Balance sample");

                    if delta == *expected_delta {
                        let elapsed = started.elapsed();
                        debug!(
                            %account,
                            %denom,
                            delta,
                            polls,
                            elapsed_ms = %elapsed.as_millis(),
                            "Balance reached expected delta"
                        );
                        return Ok(ObservedDelta {
                            account: account.clone(),
                            denom: denom.clone(),
                            baseline: *baseline,
                            final_amount: sample.amount,
                            delta,
                            polls,
                            elapsed,
                        });
                    }

                    if *detect_overshoot && overshoots(delta, *expected_delta) {
                        return Err(Error::Overshoot {
                            address: account.clone(),
                            denom: denom.clone(),
                            expected: *expected_delta,
                            observed: delta,
                        });
                    }
                }
                Err(Error::AccountQuery { source, .. }) if source.is_transient() => {
                    warn!(%account, %denom, error = %source, "Balance query failed, polling again");
                }
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    address: account.clone(),
                    denom: denom.clone(),
                    expected: *expected_delta,
                    observed: last_delta,
                    timeout: schedule.timeout,
                });
            }

            let wake = (now + schedule.interval).min(deadline);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

/// Whether `delta` has moved past `expected` in the expected direction, or
/// further than `expected` in the opposite one. Any movement counts when
/// nothing should change.
fn overshoots(delta: SignedAmount, expected: SignedAmount) -> bool {
    let past_target = match expected.signum() {
        1 => delta > expected,
        -1 => delta < expected,
        _ => delta != 0,
    };
    past_target || delta.unsigned_abs() > expected.unsigned_abs()
}
