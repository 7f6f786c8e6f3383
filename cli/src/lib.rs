//! Driver for the `panewatch` binary: one JSON operation per stdin line, one
//! JSON response per stdout line.

use std::path::PathBuf;

use clap::Parser;
use panewatch_core::ErrorKind;
use panewatch_core::Operation;
use panewatch_core::OperationResponse;
use panewatch_core::Orchestrator;
use panewatch_core::OrchestratorConfig;
use panewatch_core::coordinator::LineWriter;
use panewatch_core::dispatch;
use panewatch_core::error::ErrorPayload;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tracing::info;
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "panewatch", version, about = "Terminal-session orchestrator")]
pub struct Cli {
    /// TOML config file. Built-in defaults apply when omitted.
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Overrides `state_dir` from the config.
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Start without restoring persisted sessions.
    #[arg(long)]
    pub no_recover: bool,
}

/// Installs the stderr log subscriber unless one is already set.
pub fn setup_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = OrchestratorConfig::load(cli.config.as_deref())?;
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }
    let stdout = LineWriter::stdout();
    let orchestrator = Orchestrator::builder(config)
        .output(stdout.clone())
        .build()?;

    if !cli.no_recover {
        let report = orchestrator.recover().await?;
        for discarded in &report.discarded {
            warn!(
                source = %discarded.source,
                "discarded persisted session: {}",
                discarded.reason
            );
        }
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let served = tokio::select! {
        result = serve(&orchestrator, stdin, &stdout) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, flushing session snapshots");
            Ok(())
        }
    };

    orchestrator.shutdown().await;
    served
}

/// Answers every request line on `input` until EOF. Blank lines are skipped.
/// Responses go through `output`, which stdout trigger sinks share.
pub async fn serve<R>(orchestrator: &Orchestrator, input: R, output: &LineWriter) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Operation>(line) {
            Ok(operation) => dispatch(orchestrator, operation).await,
            Err(err) => OperationResponse::Error {
                error: ErrorPayload {
                    kind: ErrorKind::InvalidRequest,
                    detail: err.to_string(),
                },
            },
        };
        output.write_json(&response).await?;
    }
    Ok(())
}
