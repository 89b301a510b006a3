// Tube status command

use anyhow::Result;
use bns_broker::Broker;
use bns_worker::{server_status, tube_status};

use crate::output::OutputFormat;
use crate::Cli;

pub async fn run(cli: &Cli, tube: &str, output: OutputFormat) -> Result<()> {
    let mut conn = super::connect(cli).await?;
    let rendered = report(&mut conn, tube, output, cli.server).await?;
    println!("{rendered}");

    conn.close().await?;
    Ok(())
}

/// Build the status output for `tube`
///
/// With `server`, the tube list and server-wide statistics are included: as
/// extra lines in text mode, as `tubes` and `server` keys otherwise.
async fn report<B>(broker: &mut B, tube: &str, output: OutputFormat, server: bool) -> Result<String>
where
    B: Broker + ?Sized,
{
    if !server {
        let status = tube_status(broker, tube).await?;
        return Ok(match output.render(&status.stats)? {
            Some(rendered) => rendered.trim_end().to_string(),
            None => status.summary(),
        });
    }

    let status = server_status(broker, tube).await?;
    if let Some(rendered) = output.render(&status)? {
        return Ok(rendered.trim_end().to_string());
    }

    let mut lines = vec![status.tube.summary(), format!("Tubes: {}", status.tubes.join(", "))];
    lines.extend(status.server.iter().map(|(key, value)| format!("{key}: {value}")));
    Ok(lines.join("\n"))
}
