//! cdc-ncm daemon
//!
//! Bridges iOS devices that expose a USB CDC-NCM function to host TAP
//! interfaces, one bridge per attached device.

mod bridge;
mod config;
mod launcher;
mod metrics_http;
mod preflight;
mod supervisor;
mod tap;
mod usb;

use anyhow::{Context, Result};
use clap::Parser;
use common::{MetricsRegistry, setup_logging};
use config::DaemonConfig;
use launcher::UsbBridgeLauncher;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::{Supervisor, SupervisorCommand, spawn_supervisor};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use usb::UsbScanner;
use usb::activation::NCM_CONFIGURATION_COUNT;

#[derive(Parser, Debug)]
#[command(name = "cdc-ncm")]
#[command(author, version, about = "USB CDC-NCM bridge for iOS devices")]
#[command(long_about = "
Bridges iOS devices that expose a USB CDC-NCM network function to layer 2
TAP interfaces on a Linux host. Each attached device gets its own TAP
interface; addressing is left to the operator (DHCP client, ip addr, ...).

Must run as root on Linux with usbmuxd installed.

EXAMPLES:
    # Run with default config
    cdc-ncm

    # Expose Prometheus metrics on port 9100
    cdc-ncm --metrics-port 9100

    # List attached iOS devices and exit
    cdc-ncm --list-devices

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/cdc-ncm/daemon.toml
    3. /etc/cdc-ncm/daemon.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List attached iOS devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Serve Prometheus metrics on this port
    #[arg(long, alias = "prometheusport", value_name = "PORT")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let (config, config_error) = if let Some(ref path) = args.config {
        let config =
            DaemonConfig::load(Some(path.clone())).context("Failed to load configuration")?;
        (config, None)
    } else {
        DaemonConfig::load_or_default(None)
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("cdc-ncm v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);
    if let Some(e) = config_error {
        warn!("Failed to load config: {:#}, using defaults", e);
    }

    let context = rusb::Context::new().context("Failed to open USB context")?;

    if args.list_devices {
        return list_devices(context, &config);
    }

    preflight::run(&config.preflight.options()?).context("Preflight check failed")?;

    let metrics = Arc::new(MetricsRegistry::new());
    let (stop_metrics, metrics_stopped) = async_channel::bounded::<()>(1);
    let metrics_task = match args.metrics_port.or(config.telemetry.port) {
        Some(port) => {
            let ip: IpAddr = config
                .telemetry
                .bind_addr
                .parse()
                .context("Invalid telemetry bind address")?;
            let registry = metrics.clone();
            Some(tokio::spawn(async move {
                let shutdown = async move {
                    let _ = metrics_stopped.recv().await;
                };
                if let Err(e) =
                    metrics_http::serve(SocketAddr::new(ip, port), registry, shutdown).await
                {
                    error!("{:#}", e);
                }
            }))
        }
        None => None,
    };

    let scanner = UsbScanner::new(
        context.clone(),
        config.usb.vendor_id,
        config.usb.product_ids.clone(),
    );
    let launcher = UsbBridgeLauncher::new(
        context,
        metrics.clone(),
        config.network.bridge_options(),
        config.usb.transfer_timeout(),
    );
    let supervisor = Supervisor::new(
        scanner,
        launcher,
        metrics.clone(),
        &config.network.interface_name,
    );

    let (commands, command_rx) = async_channel::unbounded();
    let supervisor_handle = spawn_supervisor(supervisor, config.usb.scan_interval(), command_rx)
        .context("Failed to spawn supervisor thread")?;

    let signal_result = wait_for_signal().await;

    info!("Shutting down...");
    if commands.send(SupervisorCommand::Shutdown).await.is_err() {
        error!("Supervisor exited early");
    }
    match tokio::task::spawn_blocking(move || supervisor_handle.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Supervisor thread panicked: {:?}", e),
        Err(e) => error!("Failed to join supervisor thread: {}", e),
    }

    stop_metrics.close();
    if let Some(task) = metrics_task {
        if let Err(e) = task.await {
            error!("Metrics task failed: {}", e);
        }
    }

    info!("Shutdown complete");
    signal_result
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_signal() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to wait for SIGINT")?;
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
    Ok(())
}

/// List matching devices and exit
fn list_devices(context: rusb::Context, config: &DaemonConfig) -> Result<()> {
    let mut scanner = UsbScanner::new(
        context,
        config.usb.vendor_id,
        config.usb.product_ids.clone(),
    );
    let devices = scanner
        .matching_devices()
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No iOS devices found.");
        return Ok(());
    }

    println!("Found {} iOS device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {} [{:04x}:{:04x}]",
            device.serial, device.vendor_id, device.product_id
        );
        println!(
            "      Bus {:03} Device {:03} Configurations: {}{}",
            device.bus,
            device.address,
            device.num_configurations,
            if device.num_configurations >= NCM_CONFIGURATION_COUNT {
                " (NCM enabled)"
            } else {
                ""
            }
        );
        println!();
    }

    Ok(())
}
