//! Host terminal mode control
//!
//! Captures the invoking terminal's attributes and geometry, switches it to
//! raw mode and hands back a [`RawModeGuard`] that restores the saved
//! attributes exactly once.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use nix::sys::termios::{self, SetArg, Termios};
use tracing::{debug, info, warn};

/// Terminal geometry in characters and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    pub fn to_winsize(&self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

/// Terminal-control primitives for a descriptor.
///
/// The session only ever reaches the terminal through this trait, so the
/// device-specific calls live in one place.
pub trait TerminalControl: Send + Sync {
    fn attributes(&self, fd: BorrowedFd<'_>) -> io::Result<Termios>;

    fn set_attributes(&self, fd: BorrowedFd<'_>, attrs: &Termios) -> io::Result<()>;

    fn window_size(&self, fd: BorrowedFd<'_>) -> io::Result<WindowSize>;

    fn set_window_size(&self, fd: BorrowedFd<'_>, size: WindowSize) -> io::Result<()>;
}

/// termios and `TIOC[GS]WINSZ` on the real device
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixTerminal;

impl TerminalControl for PosixTerminal {
    fn attributes(&self, fd: BorrowedFd<'_>) -> io::Result<Termios> {
        termios::tcgetattr(fd).map_err(io::Error::from)
    }

    fn set_attributes(&self, fd: BorrowedFd<'_>, attrs: &Termios) -> io::Result<()> {
        termios::tcsetattr(fd, SetArg::TCSANOW, attrs).map_err(io::Error::from)
    }

    fn window_size(&self, fd: BorrowedFd<'_>) -> io::Result<WindowSize> {
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(WindowSize::from(ws))
    }

    fn set_window_size(&self, fd: BorrowedFd<'_>, size: WindowSize) -> io::Result<()> {
        let ws = size.to_winsize();
        let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &ws as *const _) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// The real terminal the invoking process is attached to.
///
/// Holds its own duplicate of the descriptor; the handle it was built from
/// stays with the caller.
#[derive(Debug)]
pub struct HostTerminal {
    fd: OwnedFd,
}

impl HostTerminal {
    /// Open the controlling terminal of this process (`/dev/tty`)
    pub fn open() -> io::Result<Self> {
        let tty = OpenOptions::new().read(true).write(true).open("/dev/tty")?;
        Ok(Self { fd: tty.into() })
    }

    /// Use standard input as the host terminal
    pub fn stdin() -> io::Result<Self> {
        Self::from_fd(io::stdin().as_fd())
    }

    pub fn from_fd(fd: impl AsFd) -> io::Result<Self> {
        Ok(Self {
            fd: fd.as_fd().try_clone_to_owned()?,
        })
    }

    /// A fresh `File` over a duplicate of the descriptor
    pub fn try_clone_file(&self) -> io::Result<File> {
        Ok(File::from(self.fd.try_clone()?))
    }
}

impl AsFd for HostTerminal {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Attributes saved before entering raw mode, restored at most once.
///
/// Dropping the guard restores the terminal if [`RawModeGuard::restore`]
/// has not run yet.
pub struct RawModeGuard {
    control: Arc<dyn TerminalControl>,
    fd: OwnedFd,
    saved: Option<Termios>,
}

impl RawModeGuard {
    pub fn is_active(&self) -> bool {
        self.saved.is_some()
    }

    /// Reapply the saved attributes. Later calls are no-ops.
    pub fn restore(&mut self) -> io::Result<()> {
        match self.saved.take() {
            Some(attrs) => {
                debug!("Restoring host terminal attributes");
                self.control.set_attributes(self.fd.as_fd(), &attrs)
            }
            None => Ok(()),
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!(error = %e, "Failed to restore host terminal attributes");
        }
    }
}

impl std::fmt::Debug for RawModeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawModeGuard")
            .field("fd", &self.fd)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Switches host terminals in and out of raw mode
#[derive(Clone)]
pub struct TerminalModeController {
    control: Arc<dyn TerminalControl>,
}

impl TerminalModeController {
    pub fn new(control: Arc<dyn TerminalControl>) -> Self {
        Self { control }
    }

    pub fn posix() -> Self {
        Self::new(Arc::new(PosixTerminal))
    }

    /// Save attributes and geometry of `host`, then put it in raw mode.
    ///
    /// Nothing is mutated unless the final attribute set succeeds, so an
    /// error here never leaves anything to restore.
    pub fn capture_and_enter_raw(
        &self,
        host: &HostTerminal,
    ) -> io::Result<(RawModeGuard, WindowSize)> {
        let size = self.control.window_size(host.as_fd())?;
        let saved = self.control.attributes(host.as_fd())?;
        let fd = host.as_fd().try_clone_to_owned()?;

        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        self.control.set_attributes(host.as_fd(), &raw)?;

        info!("Host terminal in raw mode ({}x{})", size.cols, size.rows);

        let guard = RawModeGuard {
            control: Arc::clone(&self.control),
            fd,
            saved: Some(saved),
        };
        Ok((guard, size))
    }

    /// Apply `size` to the pty slave
    pub fn propagate_window_size(&self, slave: BorrowedFd<'_>, size: WindowSize) -> io::Result<()> {
        debug!("Propagating window size {}x{} to pty slave", size.cols, size.rows);
        self.control.set_window_size(slave, size)
    }
}

impl Default for TerminalModeController {
    fn default() -> Self {
        Self::posix()
    }
}

impl std::fmt::Debug for TerminalModeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalModeController").finish_non_exhaustive()
    }
}
