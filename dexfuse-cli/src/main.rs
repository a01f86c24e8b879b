mod app;
mod commands;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })
    .expect("failed to set Ctrl+C handler");

    let cli = Cli::parse();

    // Show dexfuse info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let default = if cli.global.verbose {
            "dexfuse=debug"
        } else {
            "dexfuse=info"
        };
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
            )
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init();
    }

    match &cli.command {
        Command::Info { path } => commands::info::run(path, &cli.global),
        Command::Methods { path, class } => {
            commands::methods::run(path, class.as_deref(), &cli.global)
        }
        Command::Fuse {
            primary,
            secondary,
            output,
        } => commands::fuse::run(primary, secondary, output),
        Command::Protect { config } => commands::protect::run(config),
    }
}
