use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "simla", version, about = "Local serverless function emulator", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and scheduler daemon.
    Up,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(|| PathBuf::from(".simla.yaml"));
    let config = simla::config::Config::from_path(&path)?;

    simla::tracing::setup_tracing(&config)?;

    match cli.command {
        Commands::Up => {
            let service = simla::service::Service::new(config).await?;
            service.run().await
        }
    }
}
