use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sandpit", about = "Disposable KVM sandboxes for agent code")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sandpit.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate the config file and print the effective settings
    Check,

    /// Run a VM pool until interrupted
    Serve {
        /// Use the in-memory hypervisor instead of libvirt
        #[arg(long)]
        simulate: bool,
    },

    /// Run one script on a simulated pool and print the result
    Exec {
        /// Script file (`-` for stdin)
        script: PathBuf,

        /// Execution timeout in milliseconds
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,

        /// Workspace files to push before running
        #[arg(long = "file")]
        files: Vec<PathBuf>,
    },
}
