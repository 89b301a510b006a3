// Command implementations

pub mod consume;
pub mod produce;
pub mod status;

use anyhow::Result;
use bns_broker::BeanstalkConnection;

use crate::Cli;

/// Open the broker connection a command runs on
async fn connect(cli: &Cli) -> Result<BeanstalkConnection> {
    let conn = BeanstalkConnection::connect(cli.addr()).await?;
    tracing::info!(peer = conn.peer(), "Connected to beanstalkd");
    Ok(conn)
}
