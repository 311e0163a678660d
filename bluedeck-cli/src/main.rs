/*!
 * bluedeck Command Line Client
 * Drives bluedeckd over its control socket
 */

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

mod client;

use client::{BluedeckClient, Request};

#[derive(Parser)]
#[command(name = "bluedeck")]
#[command(about = "bluedeck Bluetooth session control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon socket path
    #[arg(short, long, default_value = "/run/bluedeck/bluedeck.sock")]
    socket: String,

    /// Print raw JSON responses
    #[arg(short, long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair with a device and wait for confirmation
    Pair { address: String },
    /// Connect a paired device (BR/EDR)
    Connect { address: String },
    /// Connect the configured LE profile
    LeConnect { address: String },
    /// Disconnect a device
    Disconnect { address: String },
    /// Remove a device and its pairing
    Unpair { address: String },
    /// Mark a device trusted, or revoke trust
    Trust {
        address: String,
        #[arg(long)]
        revoke: bool,
    },
    /// Show the lifecycle state of a device
    State { address: String },
    /// List known devices
    Devices {
        #[arg(value_enum, default_value_t = Filter::All)]
        filter: Filter,
    },
    /// Start or stop discovery
    Discovery {
        #[arg(value_enum)]
        toggle: Toggle,
    },
    /// Discover for a while and list what was found
    Scan {
        #[arg(short = 't', long, default_value_t = 10)]
        seconds: u64,
    },
    /// Make the adapter visible or hidden
    Discoverable {
        #[arg(value_enum)]
        toggle: Toggle,
    },
    /// Power the adapter on
    PowerOn,
    /// List connected A2DP devices
    A2dp {
        #[arg(value_enum, default_value_t = Role::Sink)]
        role: Role,
    },
    /// Stream an audio file to a device
    Play { address: String, file: PathBuf },
    /// Stop the active stream
    StopPlay,
    /// Send a media command to a device's player
    Media {
        address: String,
        #[arg(value_enum)]
        command: Media,
    },
    /// Push a file over OPP
    Send { address: String, file: PathBuf },
    /// Start receiving pushed files
    Receive { directory: Option<PathBuf> },
    /// Stop receiving pushed files
    StopReceive,
    /// Show stream and receiver status
    Status,
    /// Stop the daemon
    Shutdown,
}

#[derive(Clone, Copy, ValueEnum)]
enum Filter {
    All,
    Paired,
    Connected,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Sink,
    Source,
}

#[derive(Clone, Copy, ValueEnum)]
enum Media {
    Play,
    Pause,
    Next,
    Previous,
    Rewind,
}

/// Name as the daemon spells it.
fn wire_name(value: impl ValueEnum) -> String {
    value
        .to_possible_value()
        .map(|v| v.get_name().to_string())
        .unwrap_or_default()
}

// The daemon runs elsewhere; hand it absolute paths. Directories to be
// created do not exist yet, so fall back to a lexical join.
fn absolute(path: PathBuf) -> PathBuf {
    std::fs::canonicalize(&path)
        .or_else(|_| std::path::absolute(&path))
        .unwrap_or(path)
}

fn to_request(command: Commands) -> Request {
    match command {
        Commands::Pair { address } => Request::Pair { address },
        Commands::Connect { address } => Request::Connect { address },
        Commands::LeConnect { address } => Request::LeConnect { address },
        Commands::Disconnect { address } => Request::Disconnect { address },
        Commands::Unpair { address } => Request::Unpair { address },
        Commands::Trust { address, revoke } => Request::Trust {
            address,
            trusted: !revoke,
        },
        Commands::State { address } => Request::DeviceState { address },
        Commands::Devices { filter } => Request::ListDevices {
            filter: wire_name(filter),
        },
        Commands::Discovery { toggle: Toggle::On } => Request::StartDiscovery,
        Commands::Discovery { toggle: Toggle::Off } => Request::StopDiscovery,
        Commands::Scan { seconds } => Request::Inquiry { seconds },
        Commands::Discoverable { toggle } => Request::SetDiscoverable {
            enabled: matches!(toggle, Toggle::On),
        },
        Commands::PowerOn => Request::PowerOn,
        Commands::A2dp { role } => Request::ListA2dp {
            role: wire_name(role),
        },
        Commands::Play { address, file } => Request::StartStream {
            address,
            file: absolute(file),
        },
        Commands::StopPlay => Request::StopStream,
        Commands::Media { address, command } => Request::MediaControl {
            address,
            command: wire_name(command),
        },
        Commands::Send { address, file } => Request::SendFile {
            address,
            file: absolute(file),
        },
        Commands::Receive { directory } => Request::StartReceiver {
            directory: directory.map(absolute),
        },
        Commands::StopReceive => Request::StopReceiver,
        Commands::Status => Request::Status,
        Commands::Shutdown => Request::Shutdown,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = BluedeckClient::new(cli.socket);
    let response = client.send_request(&to_request(cli.command)).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", response.render());
    }

    if !response.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}
