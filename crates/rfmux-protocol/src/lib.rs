//! rfmux Protocol - Wire protocol for daemon communication
//!
//! This crate provides message types and request parsing for
//! communication between tool modules, web handlers and the CLI on one
//! side and the rfmux daemon on the other.

pub mod message;
pub mod parse;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, FailureReason, MessageType};
pub use parse::{parse_cycle_time, parse_targets, RawFrequency};
pub use version::{ProtocolVersion, VersionError};
