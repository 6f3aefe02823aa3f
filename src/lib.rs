//! ptyrelay - interactive pseudo-terminal sessions
//!
//! Runs a child process whose controlling terminal is a pty slave while the
//! invoking terminal sits in raw mode, relaying bytes in both directions.
//!
//! ## Components
//!
//! - **Terminal mode**: capture, enter raw mode and restore the host terminal
//! - **Child binding**: wire a command to the pty slave as a new session leader
//! - **Relay session**: start, relay and wait, restoring the terminal on every path
//! - **Configuration**: optional JSON config for the `ptyrelay` binary

pub mod config;
pub mod error;
pub mod pty;

// Re-export commonly used types
pub use config::Config;
pub use error::{RelayError, Result};
pub use pty::{CommandSpec, ExitStatus, HostTerminal, PtyPair, Session, SessionError, SessionState};
