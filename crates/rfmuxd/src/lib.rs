//! rfmux Daemon - Device lease manager and SDR sweep engine
//!
//! This crate provides the core infrastructure for the rfmux daemon:
//! - `lease` - Lease manager actor arbitrating exclusive device access
//! - `sweep` - Sweep engine actor supervising the external capture process
//! - `events` - Fan-out of sweep events to live subscribers
//! - `server` - Unix socket server for tool modules, the web layer and the CLI
//! - `config` - Daemon configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       rfmuxd daemon                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  DaemonServer   │────▶│        LeaseActor           │   │
//! │  │ (Unix Socket)   │     │  (device → lease owner)     │   │
//! │  └────────┬────────┘     └──────────────▲──────────────┘   │
//! │           │                             │ SDR lease         │
//! │           │                ┌────────────┴──────────────┐   │
//! │           └───────────────▶│        SweepActor         │   │
//! │                            │ (capture process, health) │   │
//! │  ┌─────────────────┐       └────────────┬──────────────┘   │
//! │  │ConnectionHandler│◀──── EventBridge ◀─┘ status / data    │
//! │  │  (per client)   │                                       │
//! │  └─────────────────┘                                       │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod events;
pub mod lease;
pub mod server;
pub mod sweep;
