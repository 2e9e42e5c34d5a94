//! Binary entry point for the backend service.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use tokio::net::TcpListener;

use scope_bridge::acquisition::AcquisitionEngine;
use scope_bridge::config::Settings;
use scope_bridge::instrument::{Instrument, MockScope};
use scope_bridge::transport::{tcp, TransportMux};
use scope_bridge::worker::BackendWorker;

#[derive(Parser)]
#[command(
    name = "scope-bridge",
    version,
    about = "Headless oscilloscope backend bridging a supervisor peer and an operator console"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backend service.
    Serve {
        /// Path to the TOML configuration file, without extension.
        #[arg(short, long, default_value = "config/default")]
        config: String,
    },
    /// Load and print the configuration, then exit.
    CheckConfig {
        /// Path to the TOML configuration file, without extension.
        #[arg(short, long, default_value = "config/default")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => serve(&config).await,
        Commands::CheckConfig { config } => {
            let settings = Settings::load(&config)
                .with_context(|| format!("loading configuration '{config}'"))?;
            println!("{settings:#?}");
            Ok(())
        }
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let settings = Settings::load(config_path)
        .with_context(|| format!("loading configuration '{config_path}'"))?;

    let instrument = build_instrument(&settings)?;
    let mut engine = AcquisitionEngine::new();
    engine
        .set_timeout_ms(settings.acquisition.timeout_ms)
        .context("invalid acquisition timeout in configuration")?;
    engine.set_ignore_timeout(settings.acquisition.ignore_timeout);

    let (mux, endpoints) = TransportMux::new();
    let transport = &settings.transport;
    let peer_requests = bind(&transport.peer_requests, "peer request").await?;
    let console_requests = bind(&transport.console_requests, "console request").await?;
    let peer_telemetry = bind(&transport.peer_telemetry, "peer telemetry").await?;
    let console_feed = bind(&transport.console_feed, "console feed").await?;

    tokio::spawn(tcp::serve_requests(peer_requests, endpoints.peer));
    tokio::spawn(tcp::serve_requests(console_requests, endpoints.console));
    tokio::spawn(tcp::serve_broadcasts(peer_telemetry, endpoints.peer_telemetry));
    tokio::spawn(tcp::serve_broadcasts(console_feed, endpoints.console_feed));

    let worker = BackendWorker::new(instrument, engine, mux);
    tokio::select! {
        () = worker.run() => info!("worker stopped"),
        result = tokio::signal::ctrl_c() => {
            result.context("listening for shutdown signal")?;
            info!("shutdown signal received");
        }
    }
    Ok(())
}

async fn bind(address: &str, channel: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("binding {channel} channel on {address}"))?;
    info!("{channel} channel listening on {address}");
    Ok(listener)
}

fn build_instrument(settings: &Settings) -> Result<Box<dyn Instrument>> {
    match settings.instrument.driver.as_str() {
        "mock" => Ok(Box::new(MockScope::new())),
        other => bail!("unknown instrument driver '{other}', only 'mock' is built in"),
    }
}
