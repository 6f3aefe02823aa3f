pub mod binding;
pub mod lifecycle;
pub mod pair;
pub mod relay;
pub mod session;
pub mod terminal;

pub use binding::{ChildProcessBinding, CommandSpec};
pub use lifecycle::ExitStatus;
pub use pair::PtyPair;
pub use relay::{RelayOptions, RelaySummary};
pub use session::{Session, SessionError, SessionState, Severity};
pub use terminal::{
    HostTerminal, PosixTerminal, RawModeGuard, TerminalControl, TerminalModeController,
    WindowSize,
};
