use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// dexfuse - APK hardening: DEX method relocation and native loader fusion
#[derive(Debug, Parser)]
#[command(name = "dexfuse", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Display container overview: version, integrity state, and table counts.
    Info {
        /// Path to the DEX container.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// List the methods a container defines, with their code item offsets.
    Methods {
        /// Path to the DEX container.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Filter by class descriptor substring (e.g. com/example).
        #[arg(long, value_name = "NAME")]
        class: Option<String>,
    },

    /// Fuse a payload module into a loader module, producing one shared object.
    Fuse {
        /// Path to the loader shared object.
        #[arg(value_name = "LOADER")]
        primary: PathBuf,

        /// Path to the payload shared object.
        #[arg(value_name = "PAYLOAD")]
        secondary: PathBuf,

        /// Where to write the fused module.
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Run the full hardening pipeline described by a configuration file.
    Protect {
        /// Path to the JSON pipeline configuration.
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}
