//! rfmux Daemon - Device lease manager and SDR sweep engine
//!
//! This binary runs as a background daemon, arbitrating exclusive access
//! to RF devices and supervising the SDR sweep capture process.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! rfmuxd start
//!
//! # Start the daemon (background/daemonized)
//! rfmuxd start -d
//!
//! # Use an explicit config file
//! rfmuxd start --config /etc/rfmux/config.toml
//!
//! # Stop the daemon
//! rfmuxd stop
//!
//! # Check daemon status
//! rfmuxd status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rfmuxd::config::DaemonConfig;
use rfmuxd::events::EventBridge;
use rfmuxd::lease::spawn_lease_manager;
use rfmuxd::server::{DaemonServer, Services};
use rfmuxd::sweep::spawn_sweep_engine;

/// rfmux daemon - RF device leases and SDR sweeps
#[derive(Parser, Debug)]
#[command(name = "rfmuxd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (overrides RFMUX_CONFIG and the default location)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("rfmux")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("rfmuxd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("rfmuxd.log")
}

fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let path = pid_file_path();
    let _ = fs::remove_file(path);
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig> {
    let mut config = match path {
        Some(path) => DaemonConfig::from_file(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DaemonConfig::load().context("Failed to load config")?,
    };
    if let Ok(socket) = std::env::var(rfmuxd::config::SOCKET_ENV) {
        config.socket_path = socket;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'rfmuxd stop' to stop it first.");
                process::exit(1);
            }

            // Load before forking so config errors reach the terminal
            let config = load_config(config)?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");

                let socket_path = load_config(None)
                    .map(|c| c.socket_path)
                    .unwrap_or_else(|_| rfmuxd::config::DEFAULT_SOCKET_PATH.to_string());
                if PathBuf::from(&socket_path).exists() {
                    println!("Socket: {socket_path}");
                }

                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("rfmuxd=info".parse()?)
                .add_directive("rfmux_core=info".parse()?)
                .add_directive("rfmux_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        socket = %config.socket_path,
        capture = %config.sweep.capture.program,
        "rfmux daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let devices = config.device_registry();
    let leases = spawn_lease_manager(devices.clone(), config.reaper_interval());
    info!(devices = devices.devices().len(), "Lease manager started");

    let bridge = EventBridge::new();
    bridge.spawn_heartbeat(config.heartbeat_interval(), cancel_token.clone());

    let sweep = spawn_sweep_engine(config.sweep.clone(), leases.clone(), bridge.clone());
    info!("Sweep engine started");

    let services = Services {
        leases: leases.clone(),
        sweep: sweep.clone(),
        bridge,
        devices,
    };
    let server = DaemonServer::new(&config.socket_path, services, cancel_token);

    info!(socket = %config.socket_path, "Starting server");

    let result = server.run().await;

    // Stop the capture process and hand every device back
    match sweep.stop().await {
        Ok(status) => info!(state = %status.state(), "Sweep engine stopped"),
        Err(e) => warn!(error = %e, "Could not stop sweep engine"),
    }
    let released = leases.release_all().await;
    if released > 0 {
        info!(released, "Released leases on shutdown");
    }

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("rfmux daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
