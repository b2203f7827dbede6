use crate::cmd::{plan::PlanArgs, run::RunArgs};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "exerciser")]
#[command(version, about = "Exercise bridge transfers and reconcile balances", long_about = None)]
pub struct ExerciserCli {
    #[command(subcommand)]
    pub cmd: ExerciserSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum ExerciserSubcommand {
    /// Fund, generate, broadcast and reconcile a transfer plan on a local devnet
    Run(RunArgs),

    /// Print the balance changes and funding a transfer plan implies
    Plan(PlanArgs),
}
