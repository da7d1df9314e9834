#![allow(missing_docs)]
#![allow(clippy::print_stderr)]

use std::ffi::OsStr;
use std::path::Path;

use kestrel_cli::{CliAction, CliOpts, SessionConfig};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

fn main() {
    let cli = CliOpts::parse_from_cmdline();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("KESTREL_LOG")
                .from_env_lossy(),
        )
        .init();

    let res = match cli.action {
        CliAction::Attach { config, pid } => evaluate_attach(config, pid),
    };

    if let Err(e) = res {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}

fn evaluate_attach(config: Option<String>, pid: u64) -> miette::Result<()> {
    let config = match config {
        Some(config) => parse_session_config(config)?,
        None => SessionConfig::default(),
    };

    // ptrace requests must all come from the attaching thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    runtime.block_on(kestrel_cli::evaluate_attach(pid, config))
}

fn parse_session_config(config: String) -> miette::Result<SessionConfig> {
    let path = Path::new(&config);

    let config = if let Some((filename, "kdl")) = path
        .file_name()
        .and_then(OsStr::to_str)
        .zip(path.extension().and_then(OsStr::to_str))
    {
        let content = std::fs::read_to_string(path).into_diagnostic()?;
        knus::parse(filename, &content)?
    } else {
        knus::parse("<content>", &config)?
    };

    Ok(config)
}
