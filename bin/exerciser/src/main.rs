use clap::Parser;
use opts::{ExerciserCli, ExerciserSubcommand};

mod cmd;
mod opts;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = ExerciserCli::parse();

    match args.cmd {
        ExerciserSubcommand::Run(cmd) => cmd.run().await,
        ExerciserSubcommand::Plan(cmd) => cmd.run().await,
    }
}
