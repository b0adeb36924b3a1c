// SPDX-License-Identifier: MIT
//! tcpasm entry point.
//!
//! Provides a command-line interface for analyzing packet captures,
//! handling configuration loading, and initializing the logging subsystem.
//!
//! Configuration comes from a YAML file; the log level and output directory
//! can be overridden on the command line.
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tcpasm::{analyze_pcap, config::Config, errors::Result};

/// tcpasm - passive TCP stream reassembly and traffic analysis.
///
/// Reconstructs the byte streams of every TCP connection in a capture file
/// and persists the conversations for inspection.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "TCPASM_CONFIG",
        default_value = "/etc/tcpasm/config.yml"
    )]
    config: PathBuf,

    /// Log level.
    #[arg(long, value_name = "LEVEL", default_value = "")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reassemble a capture file and persist the reconstructed streams
    Analyze {
        /// Path to the pcap file
        #[arg(value_name = "FILE")]
        pcap: PathBuf,

        /// Override the configured output directory
        #[arg(short, long, value_name = "DIR")]
        out: Option<PathBuf>,
    },
}

/// Application entry point.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    let log_level = if cli.log_level.is_empty() {
        config.log.level.clone()
    } else {
        cli.log_level.clone()
    };
    setup_logging(&log_level)?;
    cli_main(cli, config).await
}

pub async fn cli_main(cli: Cli, mut config: Config) -> Result<()> {
    match cli.command {
        Commands::Analyze { pcap, out } => {
            if let Some(out) = out {
                config.out = out;
            }
            let report = analyze_pcap(config, &pcap).await?;
            println!("{report}");
        }
    }
    Ok(())
}

/// Configures the logging subsystem based on the specified log level.
/// Filters out noisy modules.
fn setup_logging(level: &str) -> Result<()> {
    let lower_level = level.to_ascii_lowercase();
    let (tcpasm_level, other_level) = match lower_level.as_str() {
        "info-all" => ("info", "info"),
        "debug" => ("debug", "debug"),
        "trace" => ("trace", "trace"),
        "info" | "" => ("info", "warn"),
        other => (other, "warn"),
    };

    let filter_str = format!("tcpasm={tcpasm_level},{other_level}");

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_str))
        .expect("invalid log level in configuration or RUST_LOG");

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(level == "trace")
        .with_thread_ids(level == "trace")
        .init();
    Ok(())
}
