use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use esxi_fleet::backend::vsphere::VsphereConnector;
use esxi_fleet::installer::InstallerClient;
use esxi_fleet::{FleetConfig, FleetController, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "esxi-fleet")]
#[command(about = "Provision a fleet of nested ESXi hosts", long_about = None)]
struct Args {
    /// Fleet description (YAML, or TOML when the file ends in .toml)
    #[arg(short = 'c', long = "config", alias = "yaml", default_value = "template.yaml")]
    config: PathBuf,

    /// Replace the boot network adapter after install so the host gets a new MAC
    #[arg(long)]
    changemac: bool,

    /// Cancel the remaining hosts after the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting esxi-fleet");

    let config = FleetConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    config.validate().context("Invalid fleet configuration")?;

    let connector = VsphereConnector::new(&config.environment.vcenter);
    let installer = InstallerClient::new(&config.environment.kickstart_server)
        .context("Failed to create installer client")?;
    info!(
        "vCenter: {}, installer: {}",
        connector.base_url(),
        installer.base_url()
    );

    let mut options = RunOptions::from_config(&config.polling);
    options.mac_separation = args.changemac;
    options.fail_fast = args.fail_fast;

    let controller = FleetController::new(config, Arc::new(connector), Arc::new(installer), options);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, shutting down");
            signal.cancel();
        }
    });

    let report = controller.run(shutdown).await.context("Fleet run failed")?;
    report.log_summary();

    if report.interrupted {
        let unfinished = report.hosts.len() - report.installed() - report.skipped();
        bail!("Run interrupted; {} of {} hosts did not finish", unfinished, report.hosts.len());
    }
    if !report.is_success() {
        bail!("{} of {} hosts failed", report.failed(), report.hosts.len());
    }

    info!("All hosts provisioned");
    Ok(())
}
