use anyhow::{Context, Result};
use argh::FromArgs;
use pipeshell::Interpreter;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(FromArgs)]
/// A small pipeline shell: pipes, file redirections and background jobs.
struct Args {
    /// do not print the login banner or the prompt
    #[argh(switch, short = 'n')]
    no_prompt: bool,

    /// write diagnostics to this file instead of stderr
    #[argh(option)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    init_tracing(args.log_file.as_deref())?;

    let mut sh = Interpreter::default();
    sh.repl(!args.no_prompt)
}

/// Install the global subscriber. Filtering follows `RUST_LOG` and is silent when it
/// is unset.
fn init_tracing(log_file: Option<&std::path::Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
    let registry = tracing_subscriber::registry().with(filter);
    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .init();
        }
        None => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
    }
    Ok(())
}
