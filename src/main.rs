use anyhow::Context;
use clap::Parser;

use chargemaster::{cli, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = cli::Args::parse();

    match args.cmd {
        cli::Command::Ingest(cmd) => cli::run_ingest(cmd).await.context("ingest failed"),
        cli::Command::Query(cmd) => cli::run_query(cmd).await.context("query failed"),
        cli::Command::MatchCodes(cmd) => {
            cli::run_match_codes(cmd).await.context("match-codes failed")
        }
        cli::Command::Export(cmd) => cli::run_export(cmd).await.context("export failed"),
        cli::Command::Serve(cmd) => server::run(cmd).await.context("serve failed"),
    }
}
