//! Scenario orchestration and reconciliation.
//!
//! A run loads every sender's account and captures baselines of every balance
//! the plan touches. It then runs one generation and broadcast flow per sender
//! concurrently. Finally it waits on every balance concurrently until it has
//! moved by exactly the predicted amount. The outcome is one report; any
//! mismatch or failure makes the whole run fail.

use crate::{
    broadcaster::{Broadcaster, SubmitResult},
    chain::{BalanceQuery, DestinationChain, Faucet, SourceChain, TransferSigner},
    config::{BroadcastOrder, ExerciserConfig},
    error::{Error, Result},
    factory::{TransactionFactory, rate},
    metrics::ExerciserMetrics,
    plan::{ExpectedDelta, TransferPlan},
    sequencer::AccountSequencer,
    types::{Address, Amount, ChainSide, Denom, SignedAmount, balance_delta},
    watcher::{BalanceWatcher, PollSchedule, WatchRequest},
};
use futures::future::{join_all, try_join_all};
use serde::{Serialize, Serializer};
use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Collaborators and settings of a run. Passed explicitly; nothing is global.
#[derive(Clone)]
pub struct ScenarioContext {
    pub source: Arc<dyn SourceChain>,
    pub destination: Arc<dyn DestinationChain>,
    pub signer: Arc<dyn TransferSigner>,
    pub faucet: Option<Arc<dyn Faucet>>,
    pub config: ExerciserConfig,
}

impl fmt::Debug for ScenarioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioContext")
            .field("destination", &self.destination.chain_id())
            .field("faucet", &self.faucet.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One source-chain lock, credited as the wrapped asset on the destination chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLeg {
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    pub native: Denom,
}

/// Outcome of one sender's generation and broadcast flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub sender: Address,
    pub planned: u64,
    pub generated: usize,
    pub accepted: usize,
    #[serde(serialize_with = "error_message")]
    pub first_error: Option<Error>,
    #[serde(with = "crate::types::serde_millis")]
    pub generation_time: Duration,
    #[serde(with = "crate::types::serde_millis")]
    pub broadcast_time: Duration,
}

impl FlowSummary {
    pub fn is_success(&self) -> bool {
        self.first_error.is_none() && self.accepted as u64 == self.planned
    }
}

/// Expected against observed change of one balance.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub side: ChainSide,
    pub account: Address,
    pub denom: Denom,
    pub expected: SignedAmount,
    pub observed: Option<SignedAmount>,
    #[serde(rename = "match")]
    pub matched: bool,
    #[serde(serialize_with = "error_message")]
    pub error: Option<Error>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub entries: Vec<ReportEntry>,
    pub flows: Vec<FlowSummary>,
}

impl ReconciliationReport {
    pub fn is_success(&self) -> bool {
        self.entries.iter().all(|e| e.matched && e.error.is_none())
            && self.flows.iter().all(FlowSummary::is_success)
    }

    pub fn summary(&self) -> String {
        let matched = self.entries.iter().filter(|e| e.matched).count();
        let failed_flows = self.flows.iter().filter(|f| !f.is_success()).count();
        format!(
            "{matched}/{} balances matched, {failed_flows}/{} sender flows failed",
            self.entries.len(),
            self.flows.len()
        )
    }

    pub fn entry(&self, account: &Address, denom: &Denom) -> Option<&ReportEntry> {
        self.entries
            .iter()
            .find(|e| &e.account == account && &e.denom == denom)
    }

    fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::Reconciliation(Box::new(self)))
        }
    }
}

impl fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<12} {:<46} {:<8} {:>24} {:>24}  MATCH",
            "SIDE", "ACCOUNT", "DENOM", "EXPECTED", "OBSERVED"
        )?;
        for entry in &self.entries {
            let observed = entry
                .observed
                .map_or_else(|| "-".to_string(), |o| o.to_string());
            writeln!(
                f,
                "{:<12} {:<46} {:<8} {:>24} {:>24}  {}",
                entry.side.to_string(),
                entry.account.as_str(),
                entry.denom.as_str(),
                entry.expected,
                observed,
                if entry.matched { "yes" } else { "NO" }
            )?;
            if let Some(err) = &entry.error {
                writeln!(f, "    error: {err}")?;
            }
        }

        if !self.flows.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "{:<46} {:>8} {:>10} {:>9} {:>10} {:>10}",
                "SENDER", "PLANNED", "GENERATED", "ACCEPTED", "GEN_MS", "SEND_MS"
            )?;
            for flow in &self.flows {
                writeln!(
                    f,
                    "{:<46} {:>8} {:>10} {:>9} {:>10} {:>10}",
                    flow.sender.as_str(),
                    flow.planned,
                    flow.generated,
                    flow.accepted,
                    flow.generation_time.as_millis(),
                    flow.broadcast_time.as_millis()
                )?;
                if let Some(err) = &flow.first_error {
                    writeln!(f, "    first error: {err}")?;
                }
            }
        }

        write!(f, "{}", self.summary())
    }
}

fn error_message<S: Serializer>(error: &Option<Error>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => s.serialize_some(&err.to_string()),
        None => s.serialize_none(),
    }
}

#[derive(Debug)]
pub struct ScenarioRunner {
    ctx: ScenarioContext,
    cancel: CancellationToken,
    metrics: ExerciserMetrics,
}

impl ScenarioRunner {
    pub fn new(ctx: ScenarioContext, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            cancel,
            metrics: ExerciserMetrics::default(),
        }
    }

    pub fn config(&self) -> &ExerciserConfig {
        &self.ctx.config
    }

    fn chain_for(&self, side: ChainSide) -> &dyn BalanceQuery {
        match side {
            ChainSide::Source => &*self.ctx.source,
            ChainSide::Destination => &*self.ctx.destination,
        }
    }

    fn watcher(&self) -> BalanceWatcher {
        BalanceWatcher::new(self.cancel.clone(), self.metrics.clone())
    }

    fn schedule(&self) -> PollSchedule {
        PollSchedule {
            interval: self.ctx.config.watcher.poll_interval(),
            timeout: self.ctx.config.watcher.timeout(),
        }
    }

    /// Gives every sender of `plan` what it needs to send, plus fees and headroom.
    pub async fn fund_plan(&self, plan: &TransferPlan) -> Result<()> {
        let faucet = self
            .ctx
            .faucet
            .as_ref()
            .ok_or_else(|| Error::Config("funding requires a faucet".into()))?;
        let config = &self.ctx.config;

        for (sender, amounts) in
            plan.required_funding(&config.fees, config.scenario.funding_headroom_percent)
        {
            faucet
                .fund(ChainSide::Destination, &sender, &amounts)
                .await
                .map_err(|source| Error::Funding {
                    address: sender.clone(),
                    source,
                })?;
            info!(%sender, ?amounts, "Funded sender");
        }
        Ok(())
    }

    /// Runs `plan` to completion and reconciles every touched balance.
    pub async fn run(&self, plan: &TransferPlan) -> Result<ReconciliationReport> {
        let config = &self.ctx.config;
        let expected = plan.expected_deltas(&config.fees, &config.bridged_assets)?;
        info!(
            senders = plan.senders().len(),
            receivers = plan.receivers().len(),
            transfers = plan.total_transfers(),
            kind = ?plan.kind(),
            "Starting scenario"
        );

        // Load accounts before touching anything, so a non-fresh sender aborts the run.
        let query_retry = config.scenario.query_retry(&config.broadcast);
        let loaded = try_join_all(plan.senders().iter().map(|sender| async move {
            let mut sequencer = AccountSequencer::new(
                self.ctx.destination.clone(),
                config.scenario.require_fresh_senders,
                query_retry,
            );
            sequencer.current(sender).await?;
            Ok::<_, Error>(sequencer)
        }))
        .await?;

        let watcher = self.watcher();
        let baselines = try_join_all(expected.iter().map(|e| {
            let watcher = &watcher;
            async move {
                watcher
                    .snapshot(self.chain_for(e.side), &e.account, &e.denom)
                    .await
                    .map(|s| s.amount)
            }
        }))
        .await?;

        let flows = self.run_flows(plan, loaded).await;
        let stranded = stranded_accounts(plan, &flows);
        if !stranded.is_empty() {
            warn!(
                accounts = stranded.len(),
                "Sender flow failed, reporting its balances without waiting"
            );
        }

        let entries = join_all(expected.iter().zip(baselines).map(|(e, baseline)| {
            let watcher = &watcher;
            let stranded = &stranded;
            async move {
                if stranded.contains(&e.account) {
                    self.observe_once(watcher, e, baseline).await
                } else {
                    self.observe(watcher, e, baseline).await
                }
            }
        }))
        .await;

        let mut report = ReconciliationReport { entries, flows };
        attach_flow_errors(&mut report);
        info!(summary = %report.summary(), "Scenario finished");
        report.into_result()
    }

    async fn run_flows(
        &self,
        plan: &TransferPlan,
        sequencers: Vec<AccountSequencer>,
    ) -> Vec<FlowSummary> {
        let config = &self.ctx.config;
        let factory = Arc::new(TransactionFactory::new(
            self.ctx.destination.clone(),
            self.ctx.signer.clone(),
            self.metrics.clone(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            self.ctx.destination.clone(),
            config.broadcast.backoff(),
            self.metrics.clone(),
            self.cancel.clone(),
        ));
        let plan = Arc::new(plan.clone());
        let order = config.broadcast.order;

        let mut join_set = JoinSet::new();
        for (index, sequencer) in sequencers.into_iter().enumerate() {
            let factory = factory.clone();
            let broadcaster = broadcaster.clone();
            let plan = plan.clone();
            join_set.spawn(async move {
                let summary = run_flow(index, sequencer, &factory, &broadcaster, &plan, order).await;
                (index, summary)
            });
        }

        let mut summaries: Vec<Option<FlowSummary>> = vec![None; plan.senders().len()];
        let mut join_failure = None;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((index, summary)) => summaries[index] = Some(summary),
                Err(e) => {
                    error!(error = %e, "Sender flow task failed");
                    join_failure = Some(e.to_string());
                }
            }
        }

        summaries
            .into_iter()
            .enumerate()
            .map(|(index, summary)| {
                summary.unwrap_or_else(|| {
                    let sender = plan.senders()[index].clone();
                    FlowSummary {
                        first_error: Some(Error::Submission {
                            address: sender.clone(),
                            sequence: 0,
                            reason: join_failure
                                .clone()
                                .unwrap_or_else(|| "flow task did not complete".into()),
                        }),
                        sender,
                        planned: plan.sent_by_sender()[index],
                        generated: 0,
                        accepted: 0,
                        generation_time: Duration::ZERO,
                        broadcast_time: Duration::ZERO,
                    }
                })
            })
            .collect()
    }

    /// Waits until the balance has moved exactly as expected.
    async fn observe(
        &self,
        watcher: &BalanceWatcher,
        expected: &ExpectedDelta,
        baseline: Amount,
    ) -> ReportEntry {
        let request = WatchRequest {
            account: expected.account.clone(),
            denom: expected.denom.clone(),
            baseline,
            expected_delta: expected.delta,
            detect_overshoot: expected.monotonic,
        };
        let outcome = watcher
            .await_delta(self.chain_for(expected.side), &request, self.schedule())
            .await;

        let (observed, error) = match outcome {
            Ok(observed) => (Some(observed.delta), None),
            Err(err) => {
                let observed = match &err {
                    Error::Timeout { observed, .. } => *observed,
                    Error::Overshoot { observed, .. } => Some(*observed),
                    _ => None,
                };
                (observed, Some(err))
            }
        };
        entry_for(expected, observed, error)
    }

    /// Reads the balance once and compares it without waiting.
    async fn observe_once(
        &self,
        watcher: &BalanceWatcher,
        expected: &ExpectedDelta,
        baseline: Amount,
    ) -> ReportEntry {
        match watcher
            .snapshot(self.chain_for(expected.side), &expected.account, &expected.denom)
            .await
        {
            Ok(sample) => entry_for(expected, Some(balance_delta(baseline, sample.amount)), None),
            Err(err) => entry_for(expected, None, Some(err)),
        }
    }

    /// Locks on the source chain and waits for the wrapped asset to arrive.
    pub async fn run_lock(&self, leg: &LockLeg) -> Result<ReconciliationReport> {
        let wrapped = self
            .ctx
            .config
            .wrapped_for(&leg.native)
            .cloned()
            .ok_or_else(|| Error::InvalidPlan(format!("{} is not a bridged asset", leg.native)))?;
        let delta = SignedAmount::try_from(leg.amount)
            .map_err(|_| Error::InvalidPlan("lock amount overflows".into()))?;

        let expected = [
            ExpectedDelta {
                side: ChainSide::Source,
                account: leg.from.clone(),
                denom: leg.native.clone(),
                delta: -delta,
                monotonic: true,
            },
            ExpectedDelta {
                side: ChainSide::Destination,
                account: leg.to.clone(),
                denom: wrapped,
                delta,
                monotonic: true,
            },
        ];

        let watcher = self.watcher();
        let mut baselines = Vec::with_capacity(expected.len());
        for e in &expected {
            let snapshot = watcher
                .snapshot(self.chain_for(e.side), &e.account, &e.denom)
                .await?;
            baselines.push(snapshot.amount);
        }

        info!(from = %leg.from, to = %leg.to, amount = %leg.amount, denom = %leg.native, "Locking");
        let locked = async {
            let receipt = self
                .ctx
                .source
                .lock(&leg.from, &leg.to, leg.amount, &leg.native)
                .await?;
            self.ctx.source.advance_time_or_blocks().await?;
            Ok::<_, crate::chain::ChainError>(receipt)
        }
        .await;

        let entries = match locked {
            Ok(receipt) => {
                info!(tx_hash = %receipt.tx_hash, "Lock submitted");
                join_all(
                    expected
                        .iter()
                        .zip(baselines)
                        .map(|(e, baseline)| self.observe(&watcher, e, baseline)),
                )
                .await
            }
            Err(source) => {
                let err = Error::Submission {
                    address: leg.from.clone(),
                    sequence: 0,
                    reason: format!("lock failed: {source}"),
                };
                expected
                    .iter()
                    .map(|e| entry_for(e, None, Some(err.clone())))
                    .collect()
            }
        };

        ReconciliationReport {
            entries,
            flows: Vec::new(),
        }
        .into_result()
    }
}

fn entry_for(
    expected: &ExpectedDelta,
    observed: Option<SignedAmount>,
    error: Option<Error>,
) -> ReportEntry {
    ReportEntry {
        side: expected.side,
        account: expected.account.clone(),
        denom: expected.denom.clone(),
        expected: expected.delta,
        matched: error.is_none() && observed == Some(expected.delta),
        observed,
        error,
    }
}

/// Accounts whose expected delta can no longer arrive: senders of failed
/// flows and every receiver those senders had transfers planned to.
fn stranded_accounts(plan: &TransferPlan, flows: &[FlowSummary]) -> BTreeSet<Address> {
    let mut stranded = BTreeSet::new();
    for (index, flow) in flows.iter().enumerate() {
        if flow.is_success() {
            continue;
        }
        stranded.insert(flow.sender.clone());
        let row = &plan.counts()[index];
        stranded.extend(
            plan.receivers()
                .iter()
                .zip(row)
                .filter(|(_, count)| **count > 0)
                .map(|(receiver, _)| receiver.clone()),
        );
    }
    stranded
}

/// Senders' balance entries carry the first error of their flow when the
/// balance itself reported none.
fn attach_flow_errors(report: &mut ReconciliationReport) {
    for flow in &report.flows {
        let Some(err) = &flow.first_error else {
            continue;
        };
        for entry in &mut report.entries {
            if entry.side == ChainSide::Destination
                && entry.account == flow.sender
                && entry.error.is_none()
            {
                entry.error = Some(err.clone());
                entry.matched = false;
            }
        }
    }
}

async fn run_flow(
    index: usize,
    mut sequencer: AccountSequencer,
    factory: &TransactionFactory,
    broadcaster: &Broadcaster,
    plan: &TransferPlan,
    order: BroadcastOrder,
) -> FlowSummary {
    let sender = plan.senders()[index].clone();
    let planned = plan.sent_by_sender()[index];
    let order = order.for_sender(index);

    let generation_started = tokio::time::Instant::now();
    let batch = factory.build_batch(&mut sequencer, plan, index).await;
    let generation_time = generation_started.elapsed();

    let batch = match batch {
        Ok(batch) => batch,
        Err(err) => {
            error!(%sender, error = %err, "Failed to generate transfers");
            return FlowSummary {
                sender,
                planned,
                generated: 0,
                accepted: 0,
                first_error: Some(err),
                generation_time,
                broadcast_time: Duration::ZERO,
            };
        }
    };
    let generated = batch.len();

    let broadcast_started = tokio::time::Instant::now();
    let mut results = broadcaster.submit_all(batch, order).await;
    let broadcast_time = broadcast_started.elapsed();

    results.sort_by_key(|r| r.sequence);
    let accepted = results.iter().filter(|r| r.accepted).count();
    let first_error = results.into_iter().find_map(|r: SubmitResult| r.error);

    info!(
        %sender,
        generated,
        accepted,
        broadcast_ms = %broadcast_time.as_millis(),
        rate_per_sec = %format!("{:.1}", rate(accepted, broadcast_time)),
        "Sender flow finished"
    );

    FlowSummary {
        sender,
        planned,
        generated,
        accepted,
        first_error,
        generation_time,
        broadcast_time,
    }
}
