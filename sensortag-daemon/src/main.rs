/*!
 * SensorTag BLE Connection Daemon
 * Scans, connects and runs tag operations without a phone in the loop
 * Onyx Digital Intelligence Development LLC
 */

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::info;

mod btle;
mod client;
mod config;
mod ipc;
mod protocol;

use btle::BtleRadio;
use client::SensorTagClient;
use config::DaemonConfig;
use ipc::IpcServer;
use protocol::{Request, Response, StateView};
use sensortag_core::{Coordinator, Store, TaskRegistry};

#[derive(Parser)]
#[command(name = "sensortagd")]
#[command(about = "SensorTag BLE Connection Daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/sensortag/sensortagd.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,
    /// Show adapter state, known devices and recent log lines
    Status,
    /// Connect to a discovered device
    Connect { id: String },
    /// Disconnect a device
    Disconnect { id: String },
    /// Run a named test on a connected device
    Test { id: String, test: String },
    /// Write a payload to a connected device (default payload when omitted)
    Write { id: String, payload: Option<String> },
    /// Clear the log list
    ClearLogs,
    /// Forget all discovered devices
    ClearDevices,
    /// List available tests
    Tests,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "sensortagd={},sensortag_core={}",
            log_level, log_level
        ))
        .init();

    // Load configuration
    let config = DaemonConfig::load(&cli.config)?;

    let request = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => return run_daemon(config).await,
        Commands::Status => Request::GetState,
        Commands::Connect { id } => Request::Connect { id },
        Commands::Disconnect { id } => Request::Disconnect { id },
        Commands::Test { id, test } => Request::ExecuteTest { id, test },
        Commands::Write { id, payload } => Request::WriteTag { id, payload },
        Commands::ClearLogs => Request::ClearLogs,
        Commands::ClearDevices => Request::ClearDevices,
        Commands::Tests => Request::ListTests,
    };

    let client = SensorTagClient::new(config.socket_path);
    print_response(client.send_request(request).await?)
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("SensorTag daemon starting...");

    // A socket left behind by an unclean exit would make bind fail
    let socket_path = config.socket_path.clone();
    if let Some(dir) = Path::new(&socket_path).parent() {
        fs::create_dir_all(dir)?;
    }
    let _ = fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;

    let radio = BtleRadio::new(config.power_poll_interval()).await?;
    let store = Store::new();
    let tasks = Arc::new(TaskRegistry::standard());
    let coordinator = Coordinator::start(
        Arc::new(radio),
        store.clone(),
        Arc::new(config.sensortag),
        tasks.clone(),
    );

    let ipc_server = IpcServer::new(listener, store, tasks);
    info!("SensorTag daemon ready on socket: {}", socket_path);

    let result = tokio::select! {
        result = ipc_server.run() => result,
        signal = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            signal.map_err(Into::into)
        }
    };

    coordinator.shutdown().await;
    let _ = fs::remove_file(&socket_path);
    result
}

fn print_response(response: Response) -> Result<()> {
    match response {
        Response::Success { message } => println!("{}", message),
        Response::Error { message } => bail!(message),
        Response::Tests { tests } => {
            for test in tests {
                println!("{:<28} {}", test.id, test.title);
            }
        }
        Response::State { state } => print_state(&state),
    }
    Ok(())
}

fn print_state(state: &StateView) {
    println!("Adapter:      {}", state.adapter_state);
    println!(
        "Current test: {}",
        state.current_test.as_deref().unwrap_or("-")
    );
    println!();

    if state.devices.is_empty() {
        println!("No devices discovered");
    }
    for device in &state.devices {
        println!(
            "{:<20} {:<12} {:<14} {}",
            device.id,
            device.local_name.as_deref().unwrap_or("?"),
            device.connection_state.to_string(),
            device.active_error.as_deref().unwrap_or("")
        );
    }

    if !state.logs.is_empty() {
        println!();
        for line in state.logs.iter().take(20) {
            println!("  {}", line);
        }
    }
}
