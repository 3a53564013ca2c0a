use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use printer_agent::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{prelude::*, EnvFilter};

mod cmd_discover;
mod cmd_run;

/// Keep the 3D printers on this host connected to the remote control
/// service.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "printer-agent")]
struct Cli {
    /// Config file to use. Defaults apply when omitted.
    #[arg(long, short, env = "PRINTER_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, default_value = "false")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted.
    Run,

    /// Poll the detectors once and print what they found.
    Discover {
        /// Seconds to listen for network announcements before polling.
        #[arg(long, default_value = "3")]
        wait: u64,
    },
}

async fn handle_signals() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGINT handler");
            e
        })?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGTERM handler");
            e
        })?;

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await.map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up Ctrl+C handler");
            anyhow::Error::new(e)
        })?;

        tracing::info!("received Ctrl+C (SIGINT)");
    }

    tracing::info!("triggering cleanup...");
    Ok(())
}

/// OTLP exporter, only when an endpoint is configured.
fn tracer_provider() -> Result<Option<SdkTracerProvider>> {
    let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(Resource::builder().with_service_name("printer-agent").build())
        .build();
    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(Some(provider))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let provider = tracer_provider()?;
    let telemetry = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("printer-agent")));
    let (json, plain) = if cli.json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    // Initialize tracing.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(json)
        .with(plain)
        .with(telemetry)
        .init();

    let cfg = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if handle_signals().await.is_ok() {
            on_signal.cancel();
        }
    });

    let result = match cli.command {
        Commands::Run => cmd_run::main(&cli, cfg, cancel).await,
        Commands::Discover { wait } => cmd_discover::main(&cli, &cfg, wait).await,
    };

    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = format!("{:?}", e), "failed to flush traces");
        }
    }
    result
}
