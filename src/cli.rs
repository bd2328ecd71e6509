use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "noded")]
#[command(about = "Node daemon - build templates into resource-bounded container services")]
pub struct Cli {
    /// Config file path (defaults to node.yaml, searched upwards from the current directory)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Boot the node, reconcile running containers and serve until Ctrl-C
    Serve {
        /// Keep state in memory instead of the state directory
        #[arg(long)]
        ephemeral: bool,
    },
    /// List templates with their current content hash
    Templates,
    /// Validate the config, the templates and the Docker daemon
    Check,
}
