//! Trickle daemon - streaming delta relay in front of an LLM app API

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use trickle::config::{Config, load_config};
use trickle::error::Result;
use trickle::relay::RelayServer;

/// Trickle - forwards only what is new from a cumulative LLM stream
#[derive(Parser)]
#[command(name = "trickle")]
#[command(about = "A streaming relay that turns cumulative LLM snapshots into incremental deltas")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay server (default command)
    #[command(name = "serve")]
    Serve,
    /// Load and validate the config, then print the effective settings
    #[command(name = "check-config")]
    CheckConfig,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
        Some(Command::CheckConfig) => check_config(cli.config),
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,trickle=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting trickle relay");

    let config = load_config(config_path)?;
    tracing::debug!("Config loaded: {:?}", config);

    RelayServer::new(config).serve().await?;

    tracing::info!("Trickle relay stopped");
    Ok(())
}

fn check_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;
    print_config(&config);
    Ok(())
}

fn print_config(config: &Config) {
    let key_source = if config
        .upstream
        .api_key
        .as_ref()
        .is_some_and(|k| !k.is_empty())
    {
        "config file".to_string()
    } else if config.upstream.resolve_api_key().is_some() {
        format!("${}", config.upstream.api_key_env)
    } else {
        "missing".to_string()
    };

    println!("Config OK");
    println!("  listen_addr:      {}", config.server.listen_addr);
    println!("  route:            POST {}", config.server.route);
    println!(
        "  upstream url:     {}",
        config.upstream.url.as_deref().unwrap_or("-")
    );
    println!("  api key:          {key_source}");
    println!("  output_mode:      {:?}", config.relay.output_mode);
    println!("  emission:         {:?}", config.relay.emission);
    println!("  anomaly_policy:   {:?}", config.relay.anomaly_policy);
    println!("  channel_capacity: {}", config.relay.channel_capacity);
}
