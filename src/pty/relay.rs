//! The two byte-relay loops between the host terminal and the pty master.
//!
//! Each loop moves bytes in one direction only and owns its own duplicated
//! descriptors. Neither loop blocks for longer than the poll interval
//! without rechecking its cancellation token.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tuning for the relay loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Upper bound on a single readiness wait before the token is rechecked
    pub poll_interval: Duration,
    /// Read size for pty output
    pub buffer_size: usize,
    /// How long output is still copied once the loops are cancelled
    pub drain_timeout: Duration,
}

impl RelayOptions {
    /// How long a cancelled pair of loops may take to finish
    pub fn join_grace(&self) -> Duration {
        self.drain_timeout + self.poll_interval * 2
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            buffer_size: 32 * 1024,
            drain_timeout: Duration::from_millis(100),
        }
    }
}

/// Bytes moved by each loop, once both have been joined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelaySummary {
    pub output_bytes: Option<u64>,
    pub input_bytes: Option<u64>,
}

/// Wait until `fd` is readable (or hung up) for at most `timeout`
fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
    match poll(&mut fds, millis) {
        Ok(n) => Ok(n > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Copy pty output to the host terminal.
///
/// Ends silently on end-of-stream or a read error from the master. Once
/// `cancel` fires, the loop keeps reading until the master stays quiet for
/// one poll interval, but never past `drain_timeout`, so a process that
/// keeps writing cannot hold it open.
/// A failed write to the host is returned.
pub fn output_loop(
    mut master: File,
    mut host: File,
    cancel: CancellationToken,
    options: RelayOptions,
) -> io::Result<u64> {
    let mut buf = vec![0u8; options.buffer_size.max(1)];
    let mut total = 0u64;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        let draining = cancel.is_cancelled();
        if draining {
            let deadline =
                *drain_deadline.get_or_insert_with(|| Instant::now() + options.drain_timeout);
            if Instant::now() >= deadline {
                debug!("Drain deadline reached with output still pending");
                break;
            }
        }

        match wait_readable(master.as_fd(), options.poll_interval) {
            Ok(true) => {}
            Ok(false) if draining => break,
            Ok(false) => continue,
            Err(e) => {
                debug!(error = %e, "Polling pty master failed");
                break;
            }
        }

        let n = match master.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the slave side is gone
                debug!(error = %e, "Pty master read ended");
                break;
            }
        };

        host.write_all(&buf[..n])?;
        host.flush()?;
        total += n as u64;
    }

    debug!(bytes = total, "Output relay finished");
    Ok(total)
}

/// Copy keystrokes from the host terminal to the pty master, one byte per read.
///
/// Ends silently on end-of-stream or a read error from the host, and when
/// `cancel` fires. A failed write to the master is logged and returned.
pub fn input_loop(
    mut host: File,
    mut master: File,
    cancel: CancellationToken,
    options: RelayOptions,
) -> io::Result<u64> {
    let mut byte = [0u8; 1];
    let mut total = 0u64;

    while !cancel.is_cancelled() {
        match wait_readable(host.as_fd(), options.poll_interval) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                debug!(error = %e, "Polling host terminal failed");
                break;
            }
        }

        match host.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Host terminal read ended");
                break;
            }
        }

        if let Err(e) = master.write_all(&byte) {
            warn!(error = %e, "Error writing input to pty master, giving up");
            return Err(e);
        }
        total += 1;
    }

    debug!(bytes = total, "Input relay finished");
    Ok(total)
}
