//! lanshare - LAN Exposure Relay
//!
//! Expose a container service on every LAN interface.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lanshare::{
    config::{CliOverrides, ConfigManager, DiscoveryStrategy},
    service::{wait_for_stop, ServiceProcess},
    target::{DockerCli, TargetResolver},
    Config, ExposureSession, Result, SessionComponents, ShutdownCoordinator,
};

/// CLI arguments for lanshare
#[derive(Parser, Debug)]
#[command(name = "lanshare")]
#[command(about = "Expose a local container service to other devices on the LAN")]
#[command(version)]
#[command(long_about = "
Expose a local container service to other devices on the LAN.

Listens on every non-loopback IPv4 interface at one port that is free on all
of them, and relays each connection to the service until interrupted.

The target is either 127.0.0.1:<--port>, or discovered from the container:
  container-address  container IP plus the configured service port (default 22)
  environment-port   127.0.0.1 plus the port named by HOST_PORT in the container

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables (LANSHARE_CONTAINER, LANSHARE_RUNTIME,
   LANSHARE_START_PORT, LANSHARE_MAX_ATTEMPTS, LANSHARE_CONNECT_TIMEOUT,
   LANSHARE_LOG_LEVEL)
4. Built-in defaults
")]
pub struct CliArgs {
    /// Forward to 127.0.0.1:<PORT> instead of discovering the container
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Container to inspect
    #[arg(short, long)]
    pub container: Option<String>,

    /// Discovery strategy (container-address or environment-port)
    #[arg(long)]
    pub strategy: Option<DiscoveryStrategy>,

    /// First port tried when negotiating the shared listen port
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub start_port: Option<u16>,

    /// Number of ports probed before giving up
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Configuration file path
    #[arg(long, default_value = "lanshare.toml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose logging, including per-connection failures
    #[arg(short, long)]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,

    /// Local service to run for the lifetime of the session
    #[arg(last = true)]
    pub command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("lanshare: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> Result<()> {
    let mut config = ConfigManager::load(&args.config)?;
    config.merge_with_cli_args(&CliOverrides {
        container: args.container.clone(),
        strategy: args.strategy,
        start_port: args.start_port,
        max_attempts: args.max_attempts,
        log_level: args.log_level.clone(),
    });

    init_tracing(&config, args.verbose)?;

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Container: {}", config.discovery.container);
        info!("  Discovery strategy: {}", config.discovery.strategy);
        info!("  Start port: {}", config.exposure.start_port);
        info!("  Max attempts: {}", config.exposure.max_attempts);
        info!("  Connect timeout: {:?}", config.relay.connect_timeout);
        return Ok(());
    }

    let mut service = if args.command.is_empty() {
        None
    } else {
        Some(ServiceProcess::spawn(&args.command)?)
    };

    let result = expose(&config, args.port, service.as_mut()).await;

    if let Some(mut service) = service {
        if let Err(e) = service.stop().await {
            debug!("Service cleanup failed: {:#}", e);
        }
    }

    result
}

/// Build the session, print its URLs, and serve until interrupted
async fn expose(
    config: &Config,
    port_override: Option<u16>,
    service: Option<&mut ServiceProcess>,
) -> Result<()> {
    let inspector = Arc::new(DockerCli::new(&config.discovery.runtime));
    let resolver = TargetResolver::from_options(port_override, &config.discovery, inspector);
    let mut session = ExposureSession::new(SessionComponents::from_config(config, resolver));

    session.start().await?;

    println!("Service reachable on your local network at:");
    for url in session.reachable_urls() {
        println!("  {}", url);
    }
    println!("Press Ctrl+C to stop.");

    let mut stop_result = Ok(());
    let stop = async {
        stop_result = wait_for_stop(ShutdownCoordinator::wait_for_signal(), service).await;
    };

    session.run_until(stop).await?;
    stop_result?;
    info!("Shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let log_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .with(env_filter)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}
