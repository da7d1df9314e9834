//! Crate implementing the CLI commands.

mod cli;
mod config;
mod report;
#[cfg(target_os = "linux")]
mod run;

pub use self::cli::{CliAction, CliOpts};
pub use self::config::{
    BreakpointConfig, SessionConfig, StackConfig, SuspendConfig, WatchpointConfig,
};
pub use self::report::{format_location, log_notification};

/// Attaches to a process and reports its stops until it terminates, or
/// until Ctrl-C.
#[cfg(target_os = "linux")]
pub use self::run::evaluate_attach;

/// Attaching is only implemented on Linux.
#[cfg(not(target_os = "linux"))]
pub async fn evaluate_attach(_pid: u64, _config: SessionConfig) -> miette::Result<()> {
    Err(miette::miette!("attaching to a process is only supported on Linux"))
}
