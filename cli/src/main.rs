use clap::Parser;
use panewatch_cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    panewatch_cli::setup_tracing();
    panewatch_cli::run(cli).await
}
