use super::{DevnetKeys, ScenarioArgs};
use bridge_exerciser::{
    Error, LockLeg, ReconciliationReport, ScenarioContext, ScenarioRunner,
    chain::Faucet,
    config::{BroadcastOrder, ExerciserConfig},
    devnet::LocalLedger,
    types::{Amount, ChainSide},
};
use clap::{Parser, ValueEnum};
use eyre::{Result, bail, eyre};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum OrderArg {
    /// Submit each sender's transfers in sequence order
    Fifo,
    /// Submit each sender's transfers in a seeded random order
    Random,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,

    /// Broadcast order (overrides config)
    #[arg(long, value_enum)]
    order: Option<OrderArg>,

    /// Seed for random broadcast order
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Also lock this amount of the native asset on the source chain first
    #[arg(long)]
    lock: Option<Amount>,

    /// Skip funding senders from the devnet faucet
    #[arg(long)]
    no_fund: bool,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table")]
    format: String,
}

impl RunArgs {
    pub async fn run(self) -> Result<()> {
        let mut config = self.scenario.load_config()?;
        match self.order {
            Some(OrderArg::Fifo) => config.broadcast.order = BroadcastOrder::Fifo,
            Some(OrderArg::Random) => {
                config.broadcast.order = BroadcastOrder::Random { seed: self.seed }
            }
            None => {}
        }

        let keys = DevnetKeys::new(&config);
        let plan = self.scenario.build_plan(&config, &keys)?;
        let ledger = LocalLedger::new(&config);
        let faucet: Arc<dyn Faucet> = Arc::new(ledger.clone());
        let ctx = ScenarioContext {
            source: Arc::new(ledger.source()),
            destination: Arc::new(ledger.destination()),
            signer: keys.destination.clone(),
            faucet: Some(faucet.clone()),
            config: config.clone(),
        };

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling scenario");
                on_signal.cancel();
            }
        });
        let runner = ScenarioRunner::new(ctx, cancel);

        if let Some(amount) = self.lock {
            let leg = lock_leg(&config, &keys, amount)?;
            faucet
                .fund(
                    ChainSide::Source,
                    &leg.from,
                    &[(leg.native.clone(), Amount::from(config.devnet.source_funding))],
                )
                .await?;
            info!(from = %leg.from, to = %leg.to, %amount, "Running lock leg");
            self.report(runner.run_lock(&leg).await)?;
        }

        if !self.no_fund {
            runner.fund_plan(&plan).await?;
        }
        self.report(runner.run(&plan).await)
    }

    fn report(&self, outcome: bridge_exerciser::Result<ReconciliationReport>) -> Result<()> {
        let (report, failed) = match outcome {
            Ok(report) => (report, false),
            Err(Error::Reconciliation(report)) => (*report, true),
            Err(e) => return Err(e.into()),
        };

        if self.format == "json" {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("{report}");
        }

        if failed {
            bail!("reconciliation failed: {}", report.summary());
        }
        Ok(())
    }
}

fn lock_leg(config: &ExerciserConfig, keys: &DevnetKeys, amount: Amount) -> Result<LockLeg> {
    let native = config
        .native_for(&config.scenario.denom)
        .or_else(|| config.bridged_assets.first().map(|a| &a.native))
        .cloned()
        .ok_or_else(|| eyre!("no bridged asset configured for the lock leg"))?;
    Ok(LockLeg {
        from: keys.source.derive("locker"),
        to: keys.destination.derive("lock-recipient"),
        amount,
        native,
    })
}
