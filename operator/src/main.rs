//! Entry point of the pipebench operator daemon.
use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use pipebench_common::telemetry;
use pipebench_operator::{config::OperatorConfig, experiment};

#[tokio::main]
async fn main() -> Result<()> {
    let config = OperatorConfig::parse();
    telemetry::init_tracing()?;
    let (metrics_provider, registry) = telemetry::init_metrics()?;

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(err) = telemetry::metrics_server(registry, metrics_port).await {
            error!(?err, "metrics server failed");
        }
    });

    info!(?config, "starting experiment controller");
    experiment::run(config).await;

    metrics_provider.shutdown()?;
    Ok(())
}
