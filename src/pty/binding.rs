//! Binding a command to a pty slave.
//!
//! The slave becomes the child's stdin, stdout and stderr, and the child
//! starts a new session with the slave as its controlling terminal. Both
//! steps run in the forked child before exec.

use std::env;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::unistd;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Program, arguments and environment for the child
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub term: Option<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// The user's login shell, if one can be found
    pub fn login_shell() -> Option<Self> {
        detect_shell().map(|shell| Self::new(shell, Vec::<String>::new()))
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.term = Some(term.into());
        self
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(term) = &self.term {
            command.env("TERM", term);
        }
        command.envs(self.env.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        command
    }
}

/// Detect the user's preferred shell
pub fn detect_shell() -> Option<String> {
    // Try SHELL environment variable first
    if let Ok(shell) = env::var("SHELL") {
        if Path::new(&shell).exists() {
            return Some(shell);
        }
    }

    let shells = [
        "/bin/zsh",
        "/usr/bin/zsh",
        "/bin/bash",
        "/usr/bin/bash",
        "/bin/sh",
    ];

    shells
        .iter()
        .find(|shell| Path::new(shell).exists())
        .map(|shell| shell.to_string())
}

/// A command whose future process is attached to a pty slave
#[derive(Debug)]
pub struct ChildProcessBinding {
    command: Command,
    program: String,
}

impl ChildProcessBinding {
    /// Configure `spec` to run with `slave` as its standard streams and
    /// controlling terminal. Nothing is spawned yet.
    pub fn bind(spec: &CommandSpec, slave: impl AsFd) -> io::Result<Self> {
        let mut command = spec.to_command();
        attach(&mut command, slave.as_fd())?;
        debug!("Bound {} to pty slave", spec.program);
        Ok(Self {
            command,
            program: spec.program.clone(),
        })
    }

    /// Spawn the bound command. Must be called within a tokio runtime.
    pub fn spawn(&mut self) -> io::Result<Child> {
        let child = self.command.spawn()?;
        info!(pid = ?child.id(), "Spawned {}", self.program);
        Ok(child)
    }
}

fn attach(command: &mut Command, slave: BorrowedFd<'_>) -> io::Result<()> {
    command
        .stdin(Stdio::from(slave.try_clone_to_owned()?))
        .stdout(Stdio::from(slave.try_clone_to_owned()?))
        .stderr(Stdio::from(slave.try_clone_to_owned()?));

    // Runs after the standard streams are in place, so fd 0 is the slave.
    unsafe {
        command.pre_exec(|| {
            unistd::setsid()?;
            if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as libc::c_ulong, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtyPair;
    use std::io::Read;
    use std::os::fd::AsFd;

    #[test]
    fn test_shell_detection() {
        let shell = detect_shell().unwrap();
        assert!(!shell.is_empty());
        assert!(Path::new(&shell).exists());
    }

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("ls", ["-l", "/tmp"])
            .env("FOO", "bar")
            .cwd("/")
            .term("xterm-256color");
        assert_eq!(spec.program, "ls");
        assert_eq!(spec.args, vec!["-l".to_string(), "/tmp".to_string()]);
        assert_eq!(spec.env, vec![("FOO".to_string(), "bar".to_string())]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/")));
        assert_eq!(spec.term.as_deref(), Some("xterm-256color"));
    }

    #[tokio::test]
    async fn test_child_owns_the_slave_as_controlling_terminal() {
        let pair = PtyPair::open().unwrap();
        // /dev/tty only opens for a process that has a controlling terminal
        let spec = CommandSpec::new(
            "/bin/sh",
            ["-c", "test -t 0 && test -t 2 && echo tty-ok > /dev/tty"],
        );
        let mut binding = ChildProcessBinding::bind(&spec, pair.slave.as_fd()).unwrap();
        let mut child = binding.spawn().unwrap();
        drop(binding);
        drop(pair.slave);

        let status = child.wait().await.unwrap();
        assert!(status.success());

        let mut master = std::fs::File::from(pair.master);
        let mut buf = [0u8; 256];
        let n = master.read(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("tty-ok"));
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let pair = PtyPair::open().unwrap();
        let spec = CommandSpec::new("/nonexistent/ptyrelay-missing", Vec::<String>::new());
        let mut binding = ChildProcessBinding::bind(&spec, pair.slave.as_fd()).unwrap();
        assert!(binding.spawn().is_err());
    }
}
