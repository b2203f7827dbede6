//! Exerciser configuration, loaded from TOML.

use crate::{
    error::{Error, Result},
    fees::FeeSchedule,
    retry::RetryPolicy,
    types::{Denom, TransferKind},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, time::Duration};

const GWEI: u64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciserConfig {
    pub destination: DestinationConfig,
    #[serde(default)]
    pub source: SourceConfig,
    /// Native asset on the source chain and its wrapped form on the destination chain.
    pub bridged_assets: Vec<BridgedAsset>,
    #[serde(default)]
    pub fees: FeeSchedule,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub scenario: ScenarioConfig,
    #[serde(default)]
    pub devnet: DevnetConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub chain_id: String,
    #[serde(default = "default_destination_prefix")]
    pub address_prefix: String,
    /// Denom the per-transaction gas fee is paid in.
    pub fee_denom: Denom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub address_prefix: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            address_prefix: "0x".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgedAsset {
    pub native: Denom,
    pub wrapped: Denom,
}

/// Order in which one sender's transactions are handed to the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BroadcastOrder {
    /// Ascending sequence.
    #[default]
    Fifo,
    /// Draw without replacement from a generator seeded with `seed`.
    Random { seed: u64 },
}

impl BroadcastOrder {
    /// Order used by the sender at `index` in the plan: a random seed is
    /// offset by the sender index so each sender draws a different order.
    pub fn for_sender(self, index: usize) -> Self {
        match self {
            Self::Fifo => Self::Fifo,
            Self::Random { seed } => Self::Random {
                seed: seed.wrapping_add(index as u64),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub order: BroadcastOrder,
    pub max_sequence_gap_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            order: BroadcastOrder::Fifo,
            max_sequence_gap_retries: 8,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl BroadcastConfig {
    pub fn backoff(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_sequence_gap_retries,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            timeout_secs: 300,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub amount_per_tx: u64,
    pub denom: Denom,
    pub kind: TransferKind,
    /// Refuse to run from senders that already have committed transactions.
    pub require_fresh_senders: bool,
    /// Extra funding on top of the exact requirement, in percent.
    pub funding_headroom_percent: u64,
    /// Attempts for account queries that fail with transport errors.
    pub query_retries: u32,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            amount_per_tx: 123_456 * GWEI,
            denom: Denom::from("ceth"),
            kind: TransferKind::Burn,
            require_fresh_senders: true,
            funding_headroom_percent: 10,
            query_retries: 3,
        }
    }
}

impl ScenarioConfig {
    pub fn query_retry(&self, broadcast: &BroadcastConfig) -> RetryPolicy {
        RetryPolicy::new(
            self.query_retries,
            Duration::from_millis(broadcast.initial_backoff_ms),
            Duration::from_millis(broadcast.max_backoff_ms),
        )
    }
}

/// Behaviour of the in-process ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevnetConfig {
    /// Delay before burns and locks settle on the other chain.
    pub settlement_delay_ms: u64,
    /// Native balance given to every source-chain account created by the CLI.
    pub source_funding: u64,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            settlement_delay_ms: 2_000,
            source_funding: 5 * GWEI * GWEI,
        }
    }
}

fn default_destination_prefix() -> String {
    "dst1".to_string()
}

impl ExerciserConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.destination.chain_id.is_empty() {
            return Err(Error::Config("destination.chain_id must not be empty".into()));
        }
        if self.watcher.poll_interval_ms == 0 {
            return Err(Error::Config("watcher.poll_interval_ms must be positive".into()));
        }
        if self.broadcast.initial_backoff_ms > self.broadcast.max_backoff_ms {
            return Err(Error::Config(
                "broadcast.initial_backoff_ms exceeds broadcast.max_backoff_ms".into(),
            ));
        }
        let mut seen = BTreeMap::new();
        for asset in &self.bridged_assets {
            if seen.insert(&asset.wrapped, &asset.native).is_some() {
                return Err(Error::Config(format!(
                    "wrapped denom {} mapped more than once",
                    asset.wrapped
                )));
            }
        }
        Ok(())
    }

    /// Native source-chain denom that `wrapped` releases to.
    pub fn native_for(&self, wrapped: &Denom) -> Option<&Denom> {
        self.bridged_assets
            .iter()
            .find(|a| &a.wrapped == wrapped)
            .map(|a| &a.native)
    }

    /// Wrapped destination-chain denom minted for locks of `native`.
    pub fn wrapped_for(&self, native: &Denom) -> Option<&Denom> {
        self.bridged_assets
            .iter()
            .find(|a| &a.native == native)
            .map(|a| &a.wrapped)
    }

    pub fn default_test_config() -> Self {
        Self {
            destination: DestinationConfig {
                chain_id: "localnet".to_string(),
                address_prefix: default_destination_prefix(),
                fee_denom: Denom::from("rowan"),
            },
            source: SourceConfig::default(),
            bridged_assets: vec![BridgedAsset {
                native: Denom::from("eth"),
                wrapped: Denom::from("ceth"),
            }],
            fees: FeeSchedule {
                per_tx: BTreeMap::from([(Denom::from("rowan"), 1_000_000)]),
                cross_chain: BTreeMap::from([(Denom::from("ceth"), 1)]),
            },
            broadcast: BroadcastConfig::default(),
            watcher: WatcherConfig::default(),
            scenario: ScenarioConfig::default(),
            devnet: DevnetConfig::default(),
        }
    }
}
