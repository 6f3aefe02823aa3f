//! Configuration for the `ptyrelay` binary.
//!
//! Read from `<config dir>/ptyrelay/config.json` when present, or from an
//! explicit path:
//!
//! ```json
//! {
//!   "shell": "/bin/bash",
//!   "term": "xterm-256color",
//!   "env": { "LANG": "C.UTF-8" },
//!   "input_poll_interval_ms": 50,
//!   "output_buffer_size": 32768,
//!   "output_drain_ms": 100,
//!   "log_filter": "warn"
//! }
//! ```
//!
//! Every field is optional.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::pty::{CommandSpec, RelayOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Program to run when none is given on the command line
    pub shell: Option<String>,
    /// `TERM` for the child; inherited when unset
    pub term: Option<String>,
    /// Extra environment for the child
    pub env: BTreeMap<String, String>,
    pub input_poll_interval_ms: u64,
    pub output_buffer_size: usize,
    /// Upper bound on copying leftover output after the child exits
    pub output_drain_ms: u64,
    /// Fallback tracing filter when `RUST_LOG` is not set
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            term: None,
            env: BTreeMap::new(),
            input_poll_interval_ms: 50,
            output_buffer_size: 32 * 1024,
            output_drain_ms: 100,
            log_filter: "warn".to_string(),
        }
    }
}

impl Config {
    /// `<config dir>/ptyrelay/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ptyrelay").join("config.json"))
    }

    /// Load `path`, or the default location when `path` is `None`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => {
                    debug!("No config file, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            RelayError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&text)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            poll_interval: Duration::from_millis(self.input_poll_interval_ms.max(1)),
            buffer_size: self.output_buffer_size.max(1),
            drain_timeout: Duration::from_millis(self.output_drain_ms),
        }
    }

    /// Apply `term` and `env` to a command
    pub fn decorate(&self, mut spec: CommandSpec) -> CommandSpec {
        if spec.term.is_none() {
            spec.term = self.term.clone();
        }
        let mut env: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        // command-specific variables win over configured ones
        env.append(&mut spec.env);
        spec.env = env;
        spec
    }

    /// The configured shell, else the detected login shell
    pub fn shell_command(&self) -> Result<CommandSpec> {
        match &self.shell {
            Some(shell) => Ok(CommandSpec::new(shell.clone(), Vec::<String>::new())),
            None => CommandSpec::login_shell()
                .ok_or_else(|| RelayError::ShellNotFound("No suitable shell found".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.input_poll_interval_ms, 50);
        assert_eq!(config.relay_options(), RelayOptions::default());
        assert_eq!(config.log_filter, "warn");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"shell": "/bin/sh", "env": {{"A": "1"}}}}"#).unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.shell.as_deref(), Some("/bin/sh"));
        assert_eq!(config.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(config.output_buffer_size, 32 * 1024);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(Some(&dir.path().join("absent.json")));
        assert!(matches!(result, Err(RelayError::Configuration(_))));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(RelayError::Json(_))
        ));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = Config {
            input_poll_interval_ms: 0,
            output_buffer_size: 0,
            ..Config::default()
        };
        let options = config.relay_options();
        assert_eq!(options.poll_interval, Duration::from_millis(1));
        assert_eq!(options.buffer_size, 1);
    }

    #[test]
    fn test_drain_timeout_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"output_drain_ms": 250}}"#).unwrap();

        let options = Config::load(Some(file.path())).unwrap().relay_options();
        assert_eq!(options.drain_timeout, Duration::from_millis(250));
        assert_eq!(options.join_grace(), Duration::from_millis(350));
    }

    #[test]
    fn test_decorate_command() {
        let mut config = Config::default();
        config.term = Some("xterm-256color".to_string());
        config.env.insert("A".to_string(), "config".to_string());

        let spec = config.decorate(CommandSpec::new("ls", ["-a"]).env("A", "cli"));
        assert_eq!(spec.term.as_deref(), Some("xterm-256color"));
        assert_eq!(
            spec.env,
            vec![
                ("A".to_string(), "config".to_string()),
                ("A".to_string(), "cli".to_string()),
            ]
        );
    }

    #[test]
    fn test_configured_shell() {
        let config = Config {
            shell: Some("/bin/sh".to_string()),
            ..Config::default()
        };
        assert_eq!(config.shell_command().unwrap().program, "/bin/sh");
    }
}
