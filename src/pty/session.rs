//! Interactive pty session.
//!
//! A [`Session`] ties the host terminal, a pty master/slave pair and one
//! child process together:
//!
//! ```text
//! Unstarted --start--> Started --run--> Running --wait--> Terminated
//!     \--(start fails)--> Failed
//! ```
//!
//! The host terminal is in raw mode exactly between a successful start and
//! the matching restore in [`Session::wait`]. Restoration also happens when
//! a session is dropped, so no exit path leaves the terminal raw.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, OwnedFd};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pty::binding::{ChildProcessBinding, CommandSpec};
use crate::pty::lifecycle::ExitStatus;
use crate::pty::relay::{self, RelayOptions, RelaySummary};
use crate::pty::terminal::{HostTerminal, RawModeGuard, TerminalModeController, WindowSize};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Terminal mode error: {0}")]
    TerminalMode(#[source] io::Error),

    #[error("Failed to spawn child process: {0}")]
    ProcessSpawn(#[source] io::Error),

    #[error("Failed to propagate window size: {0}")]
    WindowSizePropagation(#[source] io::Error),

    #[error("Relay IO error: {0}")]
    RelayIo(#[source] io::Error),

    #[error("Failed to wait for child process: {0}")]
    Wait(#[source] io::Error),

    #[error("No command bound to session")]
    Unbound,

    #[error("Session is {actual:?}, operation needs {expected}")]
    InvalidState {
        expected: &'static str,
        actual: SessionState,
    },
}

/// Whether an error ends the session or is only worth a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Advisory,
}

impl SessionError {
    pub fn severity(&self) -> Severity {
        match self {
            SessionError::WindowSizePropagation(_) | SessionError::RelayIo(_) => Severity::Advisory,
            _ => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Started,
    Running,
    Terminated,
    Failed,
}

struct RelayTasks {
    output: JoinHandle<io::Result<u64>>,
    input: JoinHandle<io::Result<u64>>,
}

pub struct Session {
    host: HostTerminal,
    master: OwnedFd,
    slave: Option<OwnedFd>,
    binding: Option<ChildProcessBinding>,
    controller: TerminalModeController,
    options: RelayOptions,
    state: SessionState,
    raw_mode: Option<RawModeGuard>,
    window_size: Option<WindowSize>,
    child: Option<Child>,
    child_pid: Option<u32>,
    exit_status: Option<ExitStatus>,
    relays: Option<RelayTasks>,
    relay_summary: RelaySummary,
    cancel: CancellationToken,
}

impl Session {
    /// Create an unstarted session over an open pty pair.
    ///
    /// The session works on duplicates of `master` and `slave`; the caller's
    /// descriptors are never closed here. Once the child has been started the
    /// session holds no slave descriptor, so the output relay sees
    /// end-of-stream as soon as the child and the caller have both let go of it.
    pub fn new(master: impl AsFd, slave: impl AsFd, host: HostTerminal) -> io::Result<Self> {
        Ok(Self {
            host,
            master: master.as_fd().try_clone_to_owned()?,
            slave: Some(slave.as_fd().try_clone_to_owned()?),
            binding: None,
            controller: TerminalModeController::posix(),
            options: RelayOptions::default(),
            state: SessionState::Unstarted,
            raw_mode: None,
            window_size: None,
            child: None,
            child_pid: None,
            exit_status: None,
            relays: None,
            relay_summary: RelaySummary::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_controller(mut self, controller: TerminalModeController) -> Self {
        self.controller = controller;
        self
    }

    pub fn with_options(mut self, options: RelayOptions) -> Self {
        self.options = options;
        self
    }

    /// Bind `spec` to the pty slave. Replaces any earlier binding.
    pub fn command(&mut self, spec: &CommandSpec) -> Result<(), SessionError> {
        self.ensure_state(SessionState::Unstarted, "Unstarted")?;
        let slave = self.slave.as_ref().ok_or(SessionError::InvalidState {
            expected: "Unstarted",
            actual: self.state,
        })?;
        let binding = ChildProcessBinding::bind(spec, slave).map_err(SessionError::ProcessSpawn)?;
        self.binding = Some(binding);
        Ok(())
    }

    /// Put the host terminal in raw mode and spawn the bound child.
    ///
    /// On failure the terminal is back in its original mode and the session
    /// is [`SessionState::Failed`]. A failed window-size propagation is
    /// reported to the child's error stream and otherwise ignored.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.ensure_state(SessionState::Unstarted, "Unstarted")?;
        if self.binding.is_none() {
            return Err(SessionError::Unbound);
        }

        let (mut guard, size) = match self.controller.capture_and_enter_raw(&self.host) {
            Ok(captured) => captured,
            Err(e) => {
                error!(error = %e, "Could not put host terminal in raw mode");
                self.fail();
                return Err(SessionError::TerminalMode(e));
            }
        };

        let spawned = match self.binding.as_mut() {
            Some(binding) => binding.spawn(),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no command bound")),
        };
        // Dropping the binding closes the child's copies of the slave.
        self.binding = None;

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Failed to spawn child");
                if let Err(restore_err) = guard.restore() {
                    warn!(error = %restore_err, "Failed to restore host terminal after spawn failure");
                }
                self.fail();
                return Err(SessionError::ProcessSpawn(e));
            }
        };

        self.child_pid = child.id();
        self.child = Some(child);
        self.raw_mode = Some(guard);
        self.window_size = Some(size);
        self.state = SessionState::Started;
        info!(pid = ?self.child_pid, "Session started");

        if let Some(slave) = self.slave.take() {
            if let Err(e) = self.controller.propagate_window_size(slave.as_fd(), size) {
                let err = SessionError::WindowSizePropagation(e);
                warn!(error = %err, severity = ?err.severity(), "Continuing without window size");
                let mut stderr = File::from(slave);
                let _ = write!(stderr, "{}\r\n", err);
            }
        }

        Ok(())
    }

    /// Start the session, relay in both directions and wait for the child
    pub async fn run(&mut self) -> Result<ExitStatus, SessionError> {
        self.start()?;
        if let Err(e) = self.spawn_relays() {
            let err = SessionError::RelayIo(e);
            warn!(error = %err, severity = ?err.severity(), "Relay setup failed");
        }
        self.wait().await
    }

    fn spawn_relays(&mut self) -> io::Result<()> {
        let master_reader = File::from(self.master.try_clone()?);
        let master_writer = File::from(self.master.try_clone()?);
        let host_reader = self.host.try_clone_file()?;
        let host_writer = self.host.try_clone_file()?;
        let options = self.options;

        let output = {
            let cancel = self.cancel.clone();
            tokio::task::spawn_blocking(move || {
                relay::output_loop(master_reader, host_writer, cancel, options)
            })
        };
        let input = {
            let cancel = self.cancel.clone();
            tokio::task::spawn_blocking(move || {
                relay::input_loop(host_reader, master_writer, cancel, options)
            })
        };

        self.relays = Some(RelayTasks { output, input });
        self.state = SessionState::Running;
        debug!("Relay loops running");
        Ok(())
    }

    /// Wait for the child to exit, then stop the relays and restore the
    /// host terminal.
    ///
    /// Relays that have not wound down within [`RelayOptions::join_grace`]
    /// are left to finish on their own; their byte counts stay `None`.
    /// The terminal is restored on every path out of this call, including
    /// a failed wait. Once terminated, further calls return the same outcome.
    pub async fn wait(&mut self) -> Result<ExitStatus, SessionError> {
        match self.state {
            SessionState::Started | SessionState::Running => {}
            SessionState::Terminated => {
                if let Some(status) = self.exit_status {
                    return Ok(status);
                }
            }
            actual => {
                return Err(SessionError::InvalidState {
                    expected: "Started or Running",
                    actual,
                })
            }
        }

        let waited = match self.child.as_mut() {
            Some(child) => child.wait().await.map(ExitStatus::from),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no child process")),
        };

        self.cancel.cancel();
        self.join_relays().await;
        self.restore_terminal();
        self.state = SessionState::Terminated;

        match waited {
            Ok(status) => {
                info!(pid = ?self.child_pid, "Child finished: {}", status);
                self.exit_status = Some(status);
                Ok(status)
            }
            Err(e) => {
                error!(pid = ?self.child_pid, error = %e, "Waiting for child failed");
                Err(SessionError::Wait(e))
            }
        }
    }

    async fn join_relays(&mut self) {
        let Some(tasks) = self.relays.take() else {
            return;
        };
        let deadline = Instant::now() + self.options.join_grace();
        self.relay_summary.output_bytes = join_relay("output", tasks.output, deadline).await;
        self.relay_summary.input_bytes = join_relay("input", tasks.input, deadline).await;
    }

    fn restore_terminal(&mut self) {
        if let Some(mut guard) = self.raw_mode.take() {
            if let Err(e) = guard.restore() {
                warn!(error = %e, "Failed to restore host terminal attributes");
            }
        }
    }

    fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.binding = None;
    }

    fn ensure_state(&self, expected: SessionState, name: &'static str) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected: name,
                actual: self.state,
            })
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Host geometry captured at start
    pub fn window_size(&self) -> Option<WindowSize> {
        self.window_size
    }

    /// Whether this session currently holds the host terminal in raw mode
    pub fn is_raw(&self) -> bool {
        self.raw_mode.as_ref().is_some_and(RawModeGuard::is_active)
    }

    pub fn relay_summary(&self) -> RelaySummary {
        self.relay_summary
    }
}

async fn join_relay(
    name: &str,
    handle: JoinHandle<io::Result<u64>>,
    deadline: Instant,
) -> Option<u64> {
    let joined = match time::timeout_at(deadline, handle).await {
        Ok(joined) => joined,
        Err(_) => {
            // dropping the handle detaches the task; it holds only duplicates
            debug!(relay = name, "Relay still busy after cancellation, not waiting for it");
            return None;
        }
    };
    match joined {
        Ok(Ok(bytes)) => Some(bytes),
        Ok(Err(e)) => {
            let err = SessionError::RelayIo(e);
            warn!(relay = name, error = %err, severity = ?err.severity(), "Relay stopped");
            None
        }
        Err(e) => {
            warn!(relay = name, error = %e, "Relay task did not complete");
            None
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        if matches!(self.state, SessionState::Started | SessionState::Running) {
            if let Some(pid) = self.child_pid {
                debug!("Dropping unfinished session, child_pid: {}", pid);
                if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to child: {}", e);
                }
            }
        }
        // raw_mode's guard restores the terminal as it drops
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("child_pid", &self.child_pid)
            .field("window_size", &self.window_size)
            .field("raw", &self.is_raw())
            .finish_non_exhaustive()
    }
}
