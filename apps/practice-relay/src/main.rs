use clap::Parser;
use tracing::error;

use practice_relay::{
    cli::{self, Cli, Commands},
    config::RelayConfig,
    server,
    telemetry::{self, Telemetry},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Probe(args)) = cli.command {
        telemetry::init_tracing("warn")?;
        if let Err(e) = cli::run_probe(args).await {
            error!("probe error: {e:#}");
            std::process::exit(1);
        }
        return Ok(());
    }

    let telemetry = Telemetry::init()?;
    let config = RelayConfig::try_from(cli.serve)?;
    server::run(config, Some(telemetry.metrics_handle())).await
}
