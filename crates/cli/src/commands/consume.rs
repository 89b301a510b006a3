// Consume command - run the consumer until Ctrl-C

use std::sync::Arc;

use anyhow::Result;
use bns_worker::{Consumer, ConsumerConfig, HttpExecutor, HttpExecutorConfig};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::output::{print_field, OutputFormat};
use crate::Cli;

pub async fn run(cli: &Cli, tube: &str, output: OutputFormat) -> Result<()> {
    let conn = super::connect(cli).await?;

    let mut http_config = HttpExecutorConfig::new();
    if let Some(timeout) = cli.fetch_timeout() {
        http_config = http_config.with_timeout(timeout);
    }
    let executor = Arc::new(HttpExecutor::new(http_config)?);

    let config = ConsumerConfig::new(tube)
        .with_concurrency(cli.concurrency)
        .with_reserve_timeout(cli.reserve_timeout())
        .with_shutdown_timeout(cli.shutdown_timeout())
        .with_preview_chars(cli.preview_chars);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                shutdown_tx.send_replace(true);
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let report = Consumer::new(conn, executor, config, shutdown_rx)?
        .run()
        .await?;

    if output.is_text() {
        print_field("Reserved", &report.reserved.to_string());
        print_field("Dispatched", &report.dispatched.to_string());
        print_field("Buried", &report.buried.to_string());
        print_field("Timeouts", &report.timeouts.to_string());
        print_field("Released", &report.released.to_string());
        Ok(())
    } else {
        output.print_value(&report)
    }
}
