mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use output::CliOutput;
use service_node::{Error as NodeError, NodeConfig, Parser as ConfigParser};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(node_error) = e.downcast_ref::<NodeError>() {
            eprintln!("Error: {}", node_error);
            if let Some(suggestion) = node_error.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.log_level);

    let out = CliOutput;
    match cli.command {
        Commands::Serve { ephemeral } => commands::run_serve(config, ephemeral, &out).await,
        Commands::Templates => commands::run_templates(&config, &out).await,
        Commands::Check => commands::run_check(&config, &out).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    let parser = ConfigParser::new();
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => parser.find_config_file()?,
    };
    Ok(parser.load_config(&path)?)
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}
