//! CLI command implementations.

use crate::config::RelayConfig;
use crate::output::{CheckReport, OutputFormat};
use anyhow::{Context, Result};
use hookrelay_broker::BrokerClient;
use hookrelay_core::InboundEvent;
use hookrelay_server::AppState;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Connect to the broker and serve until a shutdown signal arrives.
pub fn serve(config: &RelayConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))
}

async fn run(config: &RelayConfig) -> Result<()> {
    let client = Arc::new(
        BrokerClient::from_options(config.broker_options())
            .context("Invalid broker settings")?,
    );
    client
        .connect(&CancellationToken::new())
        .await
        .context("Failed to connect to MQTT broker")?;

    let addr = config.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let state = AppState::new(config.pipeline(), config.forward.mode, client.clone());
    let served = hookrelay_server::serve(listener, state, wait_for_shutdown_signal()).await;

    if let Err(e) = client.disconnect(&CancellationToken::new()).await {
        warn!(error = %e, "Broker did not close cleanly");
    }
    served
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
}

/// Run a payload through the filter without contacting the broker.
pub fn check(config: &RelayConfig, file: &Path, format: OutputFormat) -> Result<()> {
    let report = check_report(config, &read_payload(file)?)?;
    println!("{}", report.render(format)?);
    Ok(())
}

fn check_report(config: &RelayConfig, payload: &str) -> Result<CheckReport> {
    let event = InboundEvent::from_json(payload).context("Failed to read event")?;
    Ok(config.pipeline().decide(&event).into())
}

fn read_payload(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))
    }
}
