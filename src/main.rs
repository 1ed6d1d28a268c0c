use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use puente::config::{Config, ConfigError};
use puente::{
    BackendObserver, DefaultHealthCheck, ScoreBasedRouter, StaticFetcher,
};

#[derive(Parser)]
#[command(name = "puente")]
#[command(about = "Score-based connection router for SQL database proxies")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router against the configured backend fleet
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/puente.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn run(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_from_file(&config_path)
        .map_err(|e| format!("failed to load config from {config_path:?}: {e}"))?;

    init_logging(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "starting puente");
    info!(backends = config.backends.addrs.len(), "configured fleet");

    let fetcher = Arc::new(StaticFetcher::new(
        &config.backends.addrs,
        config.backends.status_port,
    )?);
    let check = Arc::new(DefaultHealthCheck::new(config.health.check_config()));
    let observer = Arc::new(BackendObserver::new(
        fetcher,
        check,
        config.health.observer_config(),
    ));
    observer.start();

    let router = ScoreBasedRouter::new(config.balance.balance_config());
    router.init(&observer);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    router.close().await;
    observer.close().await;

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    Config::create_example_config(&output)
        .map_err(|e| format!("failed to generate config: {e}"))?;

    println!("Configuration file written to {output:?}");
    println!("Edit it to match your fleet and run:");
    println!("  puente run --config {output:?}");

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Backends: {} instances", config.backends.addrs.len());
            for (i, addr) in config.backends.addrs.iter().enumerate() {
                println!("    {}: {}", i + 1, addr);
            }
            println!("  Status port: {}", config.backends.status_port);
            println!(
                "  Health check interval: {}ms",
                config.health.check_interval_ms
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {msg}"),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {msg}"),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {msg}"),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {msg}"),
            }
            Err(Box::new(e))
        }
    }
}

fn show_version() {
    println!("puente v{}", env!("CARGO_PKG_VERSION"));
    println!("Score-based connection router for SQL database proxies");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Score-ordered backend selection with live rebalancing");
    println!("  • Session migration via asynchronous redirects");
    println!("  • Fleet health probing over SQL greeting and HTTP status");
    println!("  • High-performance async I/O with Tokio");
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
