// In-place upgrade operator binary
use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use inplace_operator::config::OperatorConfig;
use inplace_operator::drain::{DrainOptions, Drainer};
use inplace_operator::logging::init_logging;
use inplace_operator::operator;
use inplace_operator::store::KubeStore;
use kube::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "inplace-operator", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, short, env = "INPLACE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, env = "INPLACE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Print the default configuration and exit
    #[arg(long)]
    print_default_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the upgrade controllers (default)
    Run,
    /// Mark a node unschedulable
    Cordon { node: String },
    /// Mark a node schedulable again
    Uncordon { node: String },
    /// Cordon a node and evict its workloads
    Drain { node: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", OperatorConfig::sample_toml()?);
        return Ok(());
    }

    let mut config =
        OperatorConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    let _guard = init_logging(&config.log.to_log_config())?;

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!("Starting in-place upgrade operator");
            operator::run(client, &config).await?;
        }
        Command::Cordon { node } => {
            drainer(client, &config)?.cordon_node(&node).await?;
        }
        Command::Uncordon { node } => {
            drainer(client, &config)?.uncordon_node(&node).await?;
        }
        Command::Drain { node } => {
            let drainer = drainer(client, &config)?;
            drainer.cordon_node(&node).await?;
            drainer.drain_node(&node).await?;
            info!(node = %node, "Node drained");
        }
    }

    Ok(())
}

fn drainer(client: Client, config: &OperatorConfig) -> Result<Drainer> {
    let opts = DrainOptions::try_from(&config.drain)?;
    Ok(Drainer::new(Arc::new(KubeStore::new(client)), opts))
}
