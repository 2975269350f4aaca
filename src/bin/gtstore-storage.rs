use std::path::PathBuf;

use clap::Parser;
use gtstore::config::StorageConfig;
use gtstore::storage::StorageNode;

#[derive(Debug, Parser)]
#[command(name = "gtstore-storage")]
#[command(about = "gtstore storage node", long_about = None)]
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
        Some(path) => StorageConfig::from_file(&path)?,
        None => StorageConfig::from_env(),
    };

    let node = StorageNode::bind(config).await?;
    node.run(std::future::pending::<()>()).await?;

    Ok(())
}
