//! Subprocess supervisor for AoNET's public-reachability tunnel.
//!
//! Wraps the `bore` CLI: spawn it pointed at the local server port,
//! parse the public URL it announces on stdout, and keep it alive
//! across crashes.

#![deny(unsafe_code)]

mod ansi;
mod supervisor;

pub use ansi::strip_ansi;
pub use supervisor::{Supervisor, TunnelError, TunnelStatus};
