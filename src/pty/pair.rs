//! Pty master/slave allocation.
//!
//! Sessions take an already-open pair; this is the allocation the binary
//! and the tests use to get one.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty;
use tracing::debug;

#[derive(Debug)]
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
    pub slave_name: String,
}

impl PtyPair {
    /// Allocate a new pair. Neither side becomes our controlling terminal.
    pub fn open() -> io::Result<Self> {
        let master = pty::posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)?;
        pty::grantpt(&master)?;
        pty::unlockpt(&master)?;
        fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

        #[cfg(target_os = "linux")]
        let slave_name = pty::ptsname_r(&master)?;
        #[cfg(not(target_os = "linux"))]
        let slave_name = unsafe { pty::ptsname(&master)? };

        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&slave_name)?;
        debug!("PTY slave opened: {}", slave_name);

        let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
        Ok(Self {
            master,
            slave: slave.into(),
            slave_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_pair_open() {
        let pair = PtyPair::open().unwrap();
        assert!(!pair.slave_name.is_empty());
        #[cfg(target_os = "linux")]
        assert!(pair.slave_name.starts_with("/dev/pts/"));
    }

    #[test]
    fn test_slave_is_a_terminal() {
        let pair = PtyPair::open().unwrap();
        use std::os::fd::AsFd;
        assert!(nix::sys::termios::tcgetattr(pair.slave.as_fd()).is_ok());
    }
}
