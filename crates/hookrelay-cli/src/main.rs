//! hookrelay - forward work item notifications to an MQTT broker.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use config::{Overrides, RelayConfig};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "hookrelay")]
#[command(author, version, about = "Webhook to MQTT forwarding gateway")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "HOOKRELAY_CONFIG",
        default_value = "hookrelay.yml"
    )]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Broker password
    #[arg(long, global = true, env = "HOOKRELAY_MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    /// Access client id sent to the proxy in front of the broker
    #[arg(long, global = true, env = "HOOKRELAY_ACCESS_CLIENT_ID")]
    access_client_id: Option<String>,

    /// Access client secret sent to the proxy in front of the broker
    #[arg(
        long,
        global = true,
        env = "HOOKRELAY_ACCESS_CLIENT_SECRET",
        hide_env_values = true
    )]
    access_client_secret: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and accept webhook requests (default)
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long, short = 'p')]
        port: Option<u16>,
    },

    /// Run a payload through the filter without publishing
    Check {
        /// JSON payload file, or `-` for stdin
        file: PathBuf,

        /// Output format
        #[arg(long, default_value = "human")]
        format: output::OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let command = cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    });
    let (host, port) = match &command {
        Commands::Serve { host, port } => (host.clone(), *port),
        Commands::Check { .. } => (None, None),
    };

    let config = RelayConfig::load_or_default(&cli.config)?.with_overrides(Overrides {
        mqtt_password: cli.mqtt_password,
        access_client_id: cli.access_client_id,
        access_client_secret: cli.access_client_secret,
        host,
        port,
    });

    match command {
        Commands::Serve { .. } => commands::serve(&config),
        Commands::Check { file, format } => commands::check(&config, &file, format),
    }
}
