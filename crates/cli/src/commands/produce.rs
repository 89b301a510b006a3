// Produce command - put jobs into a tube

use anyhow::Result;
use bns_worker::{Producer, ProducerConfig};
use serde::Serialize;

use crate::output::OutputFormat;
use crate::Cli;

#[derive(Debug, Serialize)]
struct ProduceSummary<'a> {
    tube: &'a str,
    count: usize,
    ids: Vec<u64>,
}

pub async fn run(cli: &Cli, tube: &str, output: OutputFormat) -> Result<()> {
    let conn = super::connect(cli).await?;
    let config = ProducerConfig::new(tube)
        .with_payload(cli.payload.clone())
        .with_count(cli.count);

    let mut ids = Vec::new();
    let count = Producer::new(conn, config)
        .run(|id| {
            if output.is_text() {
                println!("job id: {id} put in.");
            } else {
                ids.push(id.0);
            }
        })
        .await?;

    output.print_value(&ProduceSummary { tube, count, ids })
}
