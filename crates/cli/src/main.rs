// bns - beanstalkd client
//
// Design Decision: Use clap derive for argument parsing with short flags
// (-l, -p, -t, -c) for the common options.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Logs go to stderr so stdout stays machine-readable.

mod commands;
mod output;

use std::time::Duration;

use clap::{CommandFactory, Parser};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ABOUT: &str = concat!(
    "Consumer client for beanstalkd, version: ",
    env!("CARGO_PKG_VERSION")
);

const MISSING_TUBE: &str =
    "You must specify the tube name by -t (call help with parameter: -h)";

#[derive(Parser, Debug)]
#[command(name = "bns")]
#[command(about = ABOUT)]
#[command(version)]
pub struct Cli {
    /// Beanstalkd host
    #[arg(short = 'l', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Beanstalkd port
    #[arg(short, long, default_value_t = 11300)]
    pub port: u16,

    /// Tube name
    #[arg(short, long)]
    pub tube: Option<String>,

    /// Command: status, produce or consume
    #[arg(short, long, default_value = "status")]
    pub command: String,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Include the tube list and server-wide statistics in status output
    #[arg(long)]
    pub server: bool,

    /// Number of jobs to produce
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub count: usize,

    /// Payload of produced jobs
    #[arg(long, default_value = bns_worker::DEFAULT_PAYLOAD)]
    pub payload: String,

    /// Maximum concurrent fetches while consuming
    #[arg(long, default_value_t = bns_worker::DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Reservation timeout in seconds
    #[arg(long, default_value_t = 5)]
    pub reserve_timeout: u64,

    /// Seconds to wait for in-flight fetches after Ctrl-C
    #[arg(long, default_value_t = 30)]
    pub shutdown_timeout: u64,

    /// Per-request timeout in seconds (unbounded if omitted)
    #[arg(long)]
    pub fetch_timeout: Option<u64>,

    /// Response body characters kept in dispatch logs
    #[arg(long, default_value_t = bns_worker::DEFAULT_PREVIEW_CHARS)]
    pub preview_chars: usize,
}

impl Cli {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout.map(Duration::from_secs)
    }
}

/// Whether to print usage instead of running
fn wants_usage(args: &[String]) -> bool {
    args.len() <= 1 || args[1] == "help"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if wants_usage(&args) {
        Cli::command().print_help()?;
        return Ok(());
    }

    let cli = Cli::parse_from(args);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bns=info,bns_worker=info,bns_broker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let tube = match cli.tube.as_deref() {
        Some(tube) if !tube.is_empty() => tube.to_string(),
        _ => {
            println!("{MISSING_TUBE}");
            return Ok(());
        }
    };
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command.as_str() {
        "status" => commands::status::run(&cli, &tube, output_format).await,
        "produce" => commands::produce::run(&cli, &tube, output_format).await,
        "consume" => commands::consume::run(&cli, &tube, output_format).await,
        other => {
            tracing::debug!(command = other, "Unknown command");
            Cli::command().print_help()?;
            Ok(())
        }
    }
}
