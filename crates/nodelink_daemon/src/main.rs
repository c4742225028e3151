use clap::Parser;
use nodelink_core::{NodeLinkConfig, Result};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "nodelinkd")]
#[command(about = "NodeLink presence monitor")]
struct Args {
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

async fn daemon_main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match args.config {
        Some(path) => NodeLinkConfig::load_from(&path).await?,
        None => NodeLinkConfig::load().await?,
    };
    config.apply_env_overrides();

    nodelink_daemon::write_pid_file()?;
    info!("Running with PID: {}", std::process::id());

    let result = nodelink_daemon::run_until_shutdown(config).await;
    if let Err(e) = &result {
        error!("Monitor error: {}", e);
    }

    if let Err(e) = nodelink_daemon::remove_pid_file() {
        error!("Failed to remove PID file: {}", e);
    }

    result
}

#[tokio::main]
async fn main() -> Result<()> {
    daemon_main().await
}
