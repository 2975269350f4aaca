use std::path::PathBuf;

use clap::Parser;
use gtstore::config::ManagerConfig;
use gtstore::manager::Manager;

#[derive(Debug, Parser)]
#[command(name = "gtstore-manager")]
#[command(about = "gtstore membership and rebalancing manager", long_about = None)]
struct Cli {
    /// Json config file; falls back to GTSTORE_* environment variables.
    #[arg(long)]
    config_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gtstore::telemetry::init();
    let args = Cli::parse();

    let config = match args.config_path {
        Some(path) => ManagerConfig::from_file(&path)?,
        None => ManagerConfig::from_env(),
    };

    let manager = Manager::bind(config).await?;
    manager.run(std::future::pending::<()>()).await?;

    Ok(())
}
