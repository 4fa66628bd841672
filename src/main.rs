use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crowdprobe::config::{Config, LogFormat, LoggingConfig};
use crowdprobe::jobs::JobRequest;

#[derive(Parser)]
#[command(
    name = "crowdprobe",
    about = "Crowdsourced network measurement scheduler",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (overrides CROWDPROBE_CONFIG and the system path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler + checkin)
    Serve {
        /// Bind address, overriding the configured one
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one measurement now and print its results as JSON
    Run {
        /// Measurement type (ping, dns_lookup, traceroute, http, tcp_throughput, udp_burst)
        kind: String,

        /// Measurement parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    // stdout is reserved for command output
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "starting crowdprobe daemon");
            crowdprobe::serve(config).await?;
        }
        Commands::Run { kind, params } => {
            let request = params
                .into_iter()
                .fold(JobRequest::new(kind), |req, (k, v)| req.param(k, v));
            let results = crowdprobe::run_measurement(&config, request).await?;
            let json = serde_json::to_string_pretty(&results).context("failed to encode results")?;
            println!("{}", json);
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
