/*!
 * bluedeck Bluetooth Session Daemon
 * Device pairing and connection, A2DP streaming and OPP transfers over BlueZ
 */

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info, warn};

mod agent;
mod bluetooth;
mod bus;
mod config;
mod error;
mod ipc;
mod process;
mod profiles;

use agent::{AgentPolicy, PairingAgent};
use bluetooth::BluetoothManager;
use bus::{BusClient, BusContext};
use config::{DaemonConfig, DEFAULT_CONFIG_PATH};
use ipc::{IpcServer, Request, RequestHandler, Response};
use process::SystemLauncher;
use profiles::ProfileManager;

#[derive(Parser)]
#[command(name = "bluedeckd")]
#[command(about = "bluedeck Bluetooth Session Daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,
    /// Check daemon status
    Status,
    /// Stop the daemon
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("bluedeck_daemon={}", log_level))
        .init();

    // Load configuration
    let config = DaemonConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::Status => check_status(&config).await,
        Commands::Stop => stop_daemon(&config).await,
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("bluedeck daemon starting...");

    let timeout = Duration::from_secs(config.bluetooth.call_timeout_secs);
    let buses = BusContext::connect(timeout, config.opp.enabled)
        .context("Failed to connect to bluetoothd")?;
    let bluez: Arc<dyn BusClient> = buses.bluez.clone();
    let obex = buses.obex.clone().map(|bus| bus as Arc<dyn BusClient>);

    // Initialize managers
    let bluetooth = Arc::new(BluetoothManager::new(bluez.clone(), &config.bluetooth));
    if let Err(e) = bluetooth.adapter.power_on().await {
        warn!("Could not power on {}: {}", config.bluetooth.adapter, e);
    }
    let launcher = Arc::new(SystemLauncher::new(Duration::from_millis(
        config.audio.terminate_grace_ms,
    )));
    let profiles = Arc::new(ProfileManager::new(
        bluez.clone(),
        obex,
        bluetooth.registry.clone(),
        launcher,
        config.audio.clone(),
        config.opp.clone(),
    ));

    let agent = if config.bluetooth.agent.enabled {
        agent::export(
            &buses.bluez.connection(),
            AgentPolicy::from_config(&config.bluetooth.agent),
        );
        let agent = PairingAgent::new(bluez.clone(), config.bluetooth.agent.capability.as_str());
        match agent.register().await {
            Ok(()) => Some(agent),
            Err(e) => {
                warn!("Pairing agent not registered: {}", e);
                None
            }
        }
    } else {
        None
    };

    // Start IPC server
    let listener = bind_socket(&config.socket_path).await?;
    let shutdown = Arc::new(Notify::new());
    let handler = RequestHandler::new(bluetooth, profiles.clone(), shutdown.clone());
    let ipc_server = IpcServer::new(listener, handler);

    info!("bluedeck daemon ready on socket: {}", config.socket_path);

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = ipc_server.run() => {
            if let Err(e) = result {
                error!("IPC server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = terminate.recv() => info!("Terminated"),
        _ = shutdown.notified() => {}
    }

    info!("Shutting down...");
    profiles.shutdown().await;
    if let Some(agent) = agent {
        if let Err(e) = agent.unregister().await {
            warn!("Failed to unregister agent: {}", e);
        }
    }
    buses.close();
    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        warn!("Failed to remove {}: {}", config.socket_path, e);
    }

    Ok(())
}

async fn bind_socket(socket_path: &str) -> Result<UnixListener> {
    let path = Path::new(socket_path);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            bail!("Another bluedeck daemon is already listening on {}", socket_path);
        }
        // Stale socket from an unclean exit
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path).with_context(|| format!("Failed to bind {}", socket_path))
}

async fn check_status(config: &DaemonConfig) -> Result<()> {
    match ipc::send_request(&config.socket_path, &Request::Status).await {
        Ok(Response::Status { stream, receiver }) => {
            println!("bluedeck daemon is running on {}", config.socket_path);
            match stream {
                Some(s) => println!("  stream:   {} -> {} (since {})", s.file.display(), s.address, s.started_at),
                None => println!("  stream:   idle"),
            }
            match receiver {
                Some(r) => println!("  receiver: {} (since {})", r.directory.display(), r.started_at),
                None => println!("  receiver: stopped"),
            }
        }
        Ok(other) => println!("Unexpected response: {:?}", other),
        Err(e) => println!("bluedeck daemon is not running: {}", e),
    }
    Ok(())
}

async fn stop_daemon(config: &DaemonConfig) -> Result<()> {
    match ipc::send_request(&config.socket_path, &Request::Shutdown).await? {
        Response::Done { ok: true, .. } => println!("bluedeck daemon stopping"),
        other => println!("Unexpected response: {:?}", other),
    }
    Ok(())
}
