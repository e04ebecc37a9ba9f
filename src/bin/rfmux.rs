//! rfmux - command-line client for the rfmux daemon
//!
//! # Usage
//!
//! ```text
//! rfmux status                         # sweep engine status
//! rfmux leases                         # who holds which device
//! rfmux acquire sdr --tool kismet      # claim a device
//! rfmux release sdr --tool kismet      # give it back
//! rfmux force-release sdr              # evict the current holder
//! rfmux sweep start -f 915 -f 2400-2410 --cycle 10
//! rfmux sweep stop
//! rfmux sweep emergency-stop
//! rfmux drain --limit 100              # buffered capture lines
//! rfmux watch                          # live events (reconnects)
//! rfmux exec --tool rtl433 --device sdr -- rtl_433 -f 433.92M
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rfmux_cli::{
    run_with_lease, ClientConfig, DaemonClient, EventWatcher, LaunchRequest, SweepReply,
    WatchEvent,
};
use rfmux_core::{SweepEvent, SweepStatus};
use rfmux_protocol::RawFrequency;

// ============================================================================
// CLI Arguments
// ============================================================================

/// rfmux - RF device leases and SDR sweeps
#[derive(Parser, Debug)]
#[command(name = "rfmux", version, about)]
struct Args {
    /// Daemon socket (defaults to RFMUX_SOCKET or /tmp/rfmux.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show sweep engine status
    Status,
    /// List current device leases
    Leases,
    /// Acquire a device lease
    Acquire {
        device: String,
        #[arg(long)]
        tool: String,
        /// Tie the lease to a process; it is released when that process exits
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Release a device lease
    Release {
        device: String,
        #[arg(long)]
        tool: String,
    },
    /// Evict whoever holds a device
    ForceRelease { device: String },
    /// Control the SDR sweep
    Sweep {
        #[command(subcommand)]
        action: SweepAction,
    },
    /// Take buffered capture lines
    Drain {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Stream live sweep events until interrupted
    Watch,
    /// Run a command while holding a device lease
    Exec {
        #[arg(long)]
        tool: String,
        #[arg(long, default_value = "sdr")]
        device: String,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Check that the daemon answers
    Ping,
}

#[derive(Subcommand, Debug)]
enum SweepAction {
    /// Start cycling through frequencies
    Start {
        /// Centre frequency in MHz, or a range like 2400-2410
        #[arg(short, long = "freq", required = true, value_parser = parse_frequency)]
        frequencies: Vec<RawFrequency>,
        /// Dwell per frequency in seconds
        #[arg(short, long, default_value_t = 10.0)]
        cycle: f64,
    },
    /// Stop the sweep and release the SDR
    Stop,
    /// Stop and kill any orphaned capture processes
    EmergencyStop,
}

/// Parses `915`, `915.5` or `2400-2410` (MHz).
fn parse_frequency(arg: &str) -> std::result::Result<RawFrequency, String> {
    let number = |s: &str| {
        s.trim()
            .parse::<f64>()
            .map_err(|_| format!("'{s}' is not a number"))
    };

    // Split on a dash that is not a leading sign
    match arg.get(1..).and_then(|rest| rest.find('-')) {
        Some(i) => {
            let (start, stop) = arg.split_at(i + 1);
            Ok(RawFrequency::Range {
                start: number(start)?,
                stop: number(&stop[1..])?,
            })
        }
        None => Ok(RawFrequency::Value(number(arg)?)),
    }
}

// ============================================================================
// Output
// ============================================================================

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_status(status: &SweepStatus) {
    println!("state:      {}", status.state());
    println!("process:    {}", status.health.process_health);
    if let Some(target) = &status.cycle.current_target {
        println!(
            "target:     {} MHz ({}/{})",
            target.mhz(),
            status.cycle.current_index + 1,
            status.cycle.target_count
        );
        println!("dwell:      {} ms", status.cycle.dwell_ms);
    }
    println!("recoveries: {}", status.health.recovery_attempts);
    println!("buffered:   {}", status.buffered_lines);
    if let Some(owner) = &status.lease_owner {
        println!("sdr lease:  {owner}");
    }
    if let Some(error) = &status.health.last_error {
        println!("last error: {error}");
    }
}

fn print_event(event: &SweepEvent) {
    match event {
        SweepEvent::Status { status } => println!(
            "[status] {} (recoveries {}, buffered {})",
            status.state(),
            status.health.recovery_attempts,
            status.buffered_lines
        ),
        SweepEvent::SweepData { line, .. } => {
            println!("[data] {:.3} MHz {:.1} dBm", line.mhz(), line.power_dbm)
        }
        SweepEvent::Error {
            message,
            recoverable,
        } => println!(
            "[error] {message}{}",
            if *recoverable { " (recovering)" } else { "" }
        ),
        SweepEvent::Heartbeat { timestamp } => println!("[heartbeat] {timestamp}"),
    }
}

/// Prints a sweep reply and fails the command when it was rejected.
fn finish_sweep(reply: SweepReply, json: bool) -> Result<()> {
    if json {
        print_json(&serde_json::json!({
            "success": reply.success,
            "reason": reply.reason,
            "message": reply.message,
            "status": reply.status,
            "orphans_terminated": reply.orphans_terminated,
        }))?;
    } else {
        print_status(&reply.status);
        if let Some(n) = reply.orphans_terminated {
            println!("orphans:    {n} terminated");
        }
    }

    if !reply.success {
        let reason = reply.reason.map(|r| r.code()).unwrap_or("failed");
        bail!(
            "{reason}: {}",
            reply.message.unwrap_or_else(|| "request rejected".to_string())
        );
    }
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn watch(config: ClientConfig, json: bool) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel_token = CancellationToken::new();
    let watcher = EventWatcher::new(config, tx, cancel_token.clone());
    let task = tokio::spawn(async move { watcher.run().await });

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(WatchEvent::Event(event)) if json => print_json(&event)?,
                Some(WatchEvent::Event(event)) => print_event(&event),
                Some(WatchEvent::Connected { client_id }) => {
                    eprintln!("connected as {client_id}");
                }
                Some(WatchEvent::Disconnected) => eprintln!("disconnected, reconnecting..."),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    cancel_token.cancel();
    let _ = task.await;
    Ok(())
}

async fn exec(config: &ClientConfig, tool: String, device: String, command: Vec<String>) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        bail!("no command given");
    };
    let request = LaunchRequest {
        tool_name: tool,
        device,
        program: program.clone(),
        args: args.to_vec(),
    };
    let status = run_with_lease(config, &request).await?;
    info!(?status, "Tool exited");
    Ok(status.code().unwrap_or(1))
}

/// One request/response exchange over a fresh connection.
async fn request(config: &ClientConfig, command: Command, json: bool) -> Result<()> {
    let mut client = DaemonClient::connect(config).await?;

    match command {
        Command::Status => {
            let status = client.sweep_status().await?;
            if json {
                print_json(&status)?;
            } else {
                print_status(&status);
            }
        }
        Command::Leases => {
            let leases = client.list_leases().await?;
            if json {
                print_json(&leases)?;
            } else if leases.is_empty() {
                println!("no leases");
            } else {
                for lease in leases {
                    let pid = lease
                        .owner_process
                        .map(|p| format!(" (pid {})", p.pid))
                        .unwrap_or_default();
                    println!(
                        "{:<16} {}{pid} since {}",
                        lease.device.name(),
                        lease.owner,
                        lease.acquired_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
        Command::Acquire { device, tool, pid } => {
            let reply = client.acquire_lease(&tool, &device, pid).await?;
            println!("{} acquired by {tool}", reply.device);
        }
        Command::Release { device, tool } => {
            let reply = client.release_lease(&tool, &device).await?;
            println!("{} released", reply.device);
        }
        Command::ForceRelease { device } => {
            let reply = client.force_release(&device).await?;
            println!("{} force-released", reply.device);
        }
        Command::Sweep { action } => {
            let reply = match action {
                SweepAction::Start { frequencies, cycle } => {
                    client.start_sweep(frequencies, cycle).await?
                }
                SweepAction::Stop => client.stop_sweep().await?,
                SweepAction::EmergencyStop => client.emergency_stop().await?,
            };
            finish_sweep(reply, json)?;
        }
        Command::Drain { limit } => {
            let lines = client.drain_capture(limit).await?;
            if json {
                print_json(&lines)?;
            } else {
                for line in lines {
                    println!(
                        "{} {:.3} MHz {:.1} dBm",
                        line.timestamp_ms,
                        line.mhz(),
                        line.power_dbm
                    );
                }
            }
        }
        Command::Ping => {
            let latency = client.ping(1).await?;
            println!("pong from {} in {latency:?}", config.socket_path.display());
        }
        // Long-running commands, dispatched by run()
        Command::Watch | Command::Exec { .. } => {}
    }

    let _ = client.disconnect().await;
    Ok(())
}

async fn run(args: Args) -> Result<i32> {
    let mut config = ClientConfig::from_env();
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    match args.command {
        Command::Watch => {
            watch(config, args.json).await?;
            Ok(0)
        }
        Command::Exec {
            tool,
            device,
            command,
        } => exec(&config, tool, device, command).await,
        command => {
            request(&config, command, args.json).await?;
            Ok(0)
        }
    }
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("rfmux: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("rfmux: {e}");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frequency_value() {
        assert_eq!(parse_frequency("915").unwrap(), RawFrequency::Value(915.0));
        assert_eq!(parse_frequency("433.92").unwrap(), RawFrequency::Value(433.92));
    }

    #[test]
    fn test_parse_frequency_range() {
        assert_eq!(
            parse_frequency("2400-2410").unwrap(),
            RawFrequency::Range {
                start: 2400.0,
                stop: 2410.0
            }
        );
        assert_eq!(
            parse_frequency(" 902 - 928 ").unwrap(),
            RawFrequency::Range {
                start: 902.0,
                stop: 928.0
            }
        );
    }

    #[test]
    fn test_parse_frequency_rejects_garbage() {
        assert!(parse_frequency("fm").is_err());
        assert!(parse_frequency("2400-").is_err());
    }

    #[test]
    fn test_negative_value_is_not_a_range() {
        // Range checks happen in the daemon; the parser only splits
        assert_eq!(parse_frequency("-5").unwrap(), RawFrequency::Value(-5.0));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "rfmux", "sweep", "start", "-f", "915", "-f", "2400-2410", "--cycle", "5",
        ])
        .unwrap();
        match args.command {
            Command::Sweep {
                action: SweepAction::Start { frequencies, cycle },
            } => {
                assert_eq!(frequencies.len(), 2);
                assert_eq!(cycle, 5.0);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let args =
            Args::try_parse_from(["rfmux", "exec", "--tool", "rtl433", "--", "rtl_433", "-f", "433.92M"])
                .unwrap();
        match args.command {
            Command::Exec { tool, device, command } => {
                assert_eq!(tool, "rtl433");
                assert_eq!(device, "sdr");
                assert_eq!(command, vec!["rtl_433", "-f", "433.92M"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
