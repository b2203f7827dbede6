//! Shared setup for end-to-end scenarios against the in-process ledger.

use crate::{
    ScenarioContext, ScenarioRunner,
    chain::{DestinationChain, Faucet},
    config::{BroadcastOrder, ExerciserConfig},
    devnet::{Keyring, LocalLedger},
    plan::TransferPlan,
    types::{Address, Amount, Denom, TransferKind},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(super) const AMOUNT: Amount = 1_000;

pub(super) fn test_config(order: BroadcastOrder) -> ExerciserConfig {
    let mut config = ExerciserConfig::default_test_config();
    config.broadcast.order = order;
    config.broadcast.initial_backoff_ms = 10;
    config.broadcast.max_backoff_ms = 200;
    config.watcher.poll_interval_ms = 100;
    config.watcher.timeout_secs = 30;
    config
}

pub(super) struct Bridge {
    pub(super) ledger: LocalLedger,
    pub(super) keyring: Arc<Keyring>,
    pub(super) config: ExerciserConfig,
}

impl Bridge {
    pub(super) fn new(config: ExerciserConfig) -> Self {
        Self {
            ledger: LocalLedger::new(&config),
            keyring: Arc::new(Keyring::new(config.destination.address_prefix.clone())),
            config,
        }
    }

    pub(super) fn senders(&self, n: usize) -> Vec<Address> {
        (0..n)
            .map(|i| self.keyring.derive(&format!("sender-{i}")))
            .collect()
    }

    /// Source-chain addresses; they receive released native funds.
    pub(super) fn source_receivers(&self, n: usize) -> Vec<Address> {
        (0..n)
            .map(|i| Address::new(format!("{}receiver{i}", self.config.source.address_prefix)))
            .collect()
    }

    pub(super) fn destination_receivers(&self, n: usize) -> Vec<Address> {
        (0..n)
            .map(|i| self.keyring.derive(&format!("receiver-{i}")))
            .collect()
    }

    pub(super) fn context(&self) -> ScenarioContext {
        let destination: Arc<dyn DestinationChain> = Arc::new(self.ledger.destination());
        let faucet: Arc<dyn Faucet> = Arc::new(self.ledger.clone());
        ScenarioContext {
            source: Arc::new(self.ledger.source()),
            destination,
            signer: self.keyring.clone(),
            faucet: Some(faucet),
            config: self.config.clone(),
        }
    }

    pub(super) fn runner(&self) -> ScenarioRunner {
        ScenarioRunner::new(self.context(), CancellationToken::new())
    }
}

pub(super) fn burn_plan(
    senders: Vec<Address>,
    receivers: Vec<Address>,
    counts: Vec<Vec<u64>>,
) -> TransferPlan {
    TransferPlan::new(
        senders,
        receivers,
        counts,
        AMOUNT,
        Denom::from("ceth"),
        TransferKind::Burn,
    )
    .unwrap()
}
