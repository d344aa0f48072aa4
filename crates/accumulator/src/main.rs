mod config;
mod logging;
mod metrics_server;
mod supervisor;

use accumulator_bus::{Bus, KafkaBus};
use accumulator_store::RocksStore;
use anyhow::Context;
use clap::Parser;
use config::Cli;
use std::sync::Arc;
use supervisor::Health;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::install(cli.log_format);

    tracing::info!(topic = cli.spleis_behov_topic, "starting accumulator");

    let (bus, rebalances) =
        KafkaBus::connect(cli.bus_config()).context("failed to connect to bus")?;
    let bus: Arc<dyn Bus> = Arc::new(bus);

    std::fs::create_dir_all(&cli.state_dir).context("failed to create state directory")?;
    let store = Arc::new(RocksStore::open(&cli.state_dir).context("failed to open state store")?);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl+C, initiating shutdown");
            ctrl_c_cancel.cancel();
        }
    });

    let health = Arc::new(Health::default());

    let metrics_addr = format!("0.0.0.0:{}", cli.metrics_port)
        .parse()
        .context("invalid metrics port")?;
    let metrics_task = axum_server::bind(metrics_addr)
        .serve(metrics_server::build_metrics_router().into_make_service());
    tokio::spawn(async move {
        if let Err(err) = metrics_task.await {
            tracing::error!(%err, "metrics server exited");
        }
    });

    let health_addr = format!("0.0.0.0:{}", cli.health_port)
        .parse()
        .context("invalid health port")?;
    let health_task = axum_server::bind(health_addr)
        .serve(metrics_server::build_health_router(health.clone()).into_make_service());
    tokio::spawn(async move {
        if let Err(err) = health_task.await {
            tracing::error!(%err, "health server exited");
        }
    });

    supervisor::run(bus, rebalances, store, cli.commit_interval, cancel, health).await;

    tracing::info!("accumulator stopped");
    Ok(())
}
