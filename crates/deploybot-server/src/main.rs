use clap::Parser;
use std::path::PathBuf;

use deploybot_server::ControllerConfig;

#[derive(Parser)]
#[command(
    name = "deploybot",
    about = "DeployBot controller — dispatch deployment jobs to polling agents",
    version
)]
struct Cli {
    /// Controller config file (YAML)
    #[arg(long, env = "DEPLOYBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,

    /// Override the database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Override the repo bindings file
    #[arg(long)]
    bindings: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = ControllerConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(bindings) = cli.bindings {
        config.bindings_path = bindings;
    }

    deploybot_server::serve(config).await
}
