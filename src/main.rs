use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use ptyrelay::pty::{CommandSpec, HostTerminal, PtyPair, Session};
use ptyrelay::Config;

/// Run a command on a fresh pseudo-terminal, relaying this terminal to it
#[derive(Parser, Debug)]
#[command(name = "ptyrelay", version, about)]
struct Cli {
    /// Config file (default: <config dir>/ptyrelay/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra environment for the child, as KEY=VALUE
    #[arg(short = 'e', long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Working directory for the child
    #[arg(short = 'C', long)]
    cwd: Option<PathBuf>,

    /// Program and arguments; defaults to the configured or login shell
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    // stderr only; stdout belongs to the relayed session
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut spec = match cli.command.split_first() {
        Some((program, args)) => CommandSpec::new(program.clone(), args.iter().cloned()),
        None => config.shell_command()?,
    };
    spec.env.extend(cli.env);
    if let Some(dir) = cli.cwd {
        spec = spec.cwd(dir);
    }
    let spec = config.decorate(spec);
    info!("Running {} {:?}", spec.program, spec.args);

    let pair = PtyPair::open().context("allocating pseudo-terminal")?;
    debug!("Using {}", pair.slave_name);
    let host = match HostTerminal::open() {
        Ok(tty) => tty,
        Err(e) => {
            debug!(error = %e, "No /dev/tty, falling back to stdin");
            HostTerminal::stdin().context("opening host terminal")?
        }
    };

    let mut session = Session::new(&pair.master, &pair.slave, host)?
        .with_options(config.relay_options());
    session.command(&spec)?;
    // the child holds its own copies; keeping ours would hide end-of-stream
    drop(pair.slave);

    let status = session.run().await?;
    info!("{} finished with {}", spec.program, status);
    drop(session);

    std::process::exit(status.as_shell_code());
}
