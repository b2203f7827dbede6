pub mod plan;
pub mod run;

use bridge_exerciser::{
    ExerciserConfig, TransferPlan,
    devnet::Keyring,
    types::{Address, Amount, Denom, TransferKind},
};
use clap::{Args, ValueEnum};
use eyre::Result;
use std::{path::PathBuf, sync::Arc};

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum KindArg {
    /// Burn wrapped tokens, releasing native tokens on the source chain
    Burn,
    /// Plain send between destination accounts
    Send,
}

impl From<KindArg> for TransferKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Burn => Self::Burn,
            KindArg::Send => Self::Send,
        }
    }
}

/// Options shared by every command that builds a transfer plan.
#[derive(Args, Debug)]
pub struct ScenarioArgs {
    /// Path to exerciser config file
    #[arg(short, long, env = "EXERCISER_CONFIG")]
    config: Option<PathBuf>,

    /// Number of sending accounts
    #[arg(long, default_value_t = 1)]
    senders: usize,

    /// Number of receiving accounts
    #[arg(long, default_value_t = 1)]
    receivers: usize,

    /// Transfers from every sender to every receiver
    #[arg(long, default_value_t = 1, conflicts_with = "matrix")]
    count: u64,

    /// Per-pair counts, rows by sender: "1,2,3;3,2,1"
    #[arg(long)]
    matrix: Option<String>,

    /// Amount per transfer (overrides config)
    #[arg(long)]
    amount: Option<Amount>,

    /// Denom to transfer (overrides config)
    #[arg(long)]
    denom: Option<String>,

    /// Transfer kind (overrides config)
    #[arg(long, value_enum)]
    kind: Option<KindArg>,
}

impl ScenarioArgs {
    pub fn load_config(&self) -> Result<ExerciserConfig> {
        let mut config = if let Some(config_path) = &self.config {
            ExerciserConfig::load(config_path)?
        } else {
            ExerciserConfig::default_test_config()
        };
        if let Some(kind) = self.kind {
            config.scenario.kind = kind.into();
        }
        if let Some(denom) = &self.denom {
            config.scenario.denom = Denom::new(denom.clone());
        }
        Ok(config)
    }

    /// Builds the plan over deterministic devnet accounts.
    pub fn build_plan(&self, config: &ExerciserConfig, keys: &DevnetKeys) -> Result<TransferPlan> {
        let kind = config.scenario.kind;
        let amount = self
            .amount
            .unwrap_or_else(|| Amount::from(config.scenario.amount_per_tx));
        let counts = match &self.matrix {
            Some(matrix) => TransferPlan::parse_matrix(matrix)?,
            None => vec![vec![self.count; self.receivers]; self.senders],
        };
        let receivers = counts.first().map_or(self.receivers, Vec::len);

        let plan = TransferPlan::new(
            keys.senders(counts.len()),
            keys.receivers(kind, receivers),
            counts,
            amount,
            config.scenario.denom.clone(),
            kind,
        )?;
        Ok(plan)
    }
}

/// Deterministic keys for both chains of the devnet.
pub struct DevnetKeys {
    pub destination: Arc<Keyring>,
    pub source: Keyring,
}

impl DevnetKeys {
    pub fn new(config: &ExerciserConfig) -> Self {
        Self {
            destination: Arc::new(Keyring::new(config.destination.address_prefix.clone())),
            source: Keyring::new(config.source.address_prefix.clone()),
        }
    }

    pub fn senders(&self, n: usize) -> Vec<Address> {
        (0..n)
            .map(|i| self.destination.derive(&format!("sender-{i}")))
            .collect()
    }

    /// Burns release to source-chain accounts; sends stay on the destination chain.
    pub fn receivers(&self, kind: TransferKind, n: usize) -> Vec<Address> {
        let keyring = match kind {
            TransferKind::Burn => &self.source,
            TransferKind::Send => &self.destination,
        };
        (0..n)
            .map(|i| keyring.derive(&format!("receiver-{i}")))
            .collect()
    }
}
