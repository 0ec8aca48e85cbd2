//! Command-line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Clustered control plane for media-processing nodes.
#[derive(Debug, Parser)]
#[command(name = "fleetcast", version, about)]
pub struct Cli {
    /// The command to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a cluster node.
    Serve(ServeArgs),
    /// Print the version.
    Version,
}

/// Arguments of the `serve` command.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Path to the configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}
